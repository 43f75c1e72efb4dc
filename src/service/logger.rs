//! The `Logger` service: structured records with a level, a message and
//! tags. The default implementation forwards onto the `log` facade, so any
//! `log`-compatible sink the host application installed sees the records.

use std::rc::Rc;

use crate::effect::{Effect, Env};
use crate::exit::Exit;

/// Structured log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        };
        f.write_str(s)
    }
}

impl From<Level> for log::Level {
    fn from(level: Level) -> Self {
        match level {
            Level::Trace => log::Level::Trace,
            Level::Debug => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error => log::Level::Error,
        }
    }
}

pub trait Logger {
    fn log(&self, level: Level, message: &str, tags: &[(&str, String)]);
}

/// The `Logger` service handle stored in the context.
#[derive(Clone)]
pub struct LoggerService(pub Rc<dyn Logger>);

/// Forwards records onto the `log` facade, appending tags as `key=value`
/// pairs.
pub struct FacadeLogger;

impl Logger for FacadeLogger {
    fn log(&self, level: Level, message: &str, tags: &[(&str, String)]) {
        let level = log::Level::from(level);
        if tags.is_empty() {
            log::log!(level, "{message}");
        } else {
            let rendered: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
            log::log!(level, "{message} {}", rendered.join(" "));
        }
    }
}

impl<E: 'static> Effect<(), E> {
    /// Emits a structured log record through the `Logger` service, falling
    /// back to the `log` facade when no logger service is registered.
    pub fn log(level: Level, message: impl Into<String>) -> Effect<(), E> {
        let message = message.into();
        Effect::from_async(move |env: Env| {
            let message = message.clone();
            async move {
                match env.ctx.get::<LoggerService>() {
                    Some(logger) => logger.0.log(level, &message, &[]),
                    None => log::log!(log::Level::from(level), "{message}"),
                }
                Exit::Success(())
            }
        })
    }
}
