use mongoproxy_wire::{Outcome, Request, Response};
use tracing::Level;

use crate::config::StageConfig;
use crate::error::ConfigError;
use crate::stage::{Next, Stage};

/// Observer that lets the rest of the chain run, then logs what happened.
#[derive(Debug)]
pub struct TraceStage {
    level: Level,
}

impl TraceStage {
    pub const NAME: &'static str = "trace";

    pub fn level(&self) -> Level {
        self.level
    }
}

impl Default for TraceStage {
    fn default() -> Self {
        Self {
            level: Level::DEBUG,
        }
    }
}

macro_rules! trace_event {
    ($level:expr, $($field:tt)*) => {
        match $level {
            Level::ERROR => tracing::event!(Level::ERROR, $($field)*),
            Level::WARN => tracing::event!(Level::WARN, $($field)*),
            Level::INFO => tracing::event!(Level::INFO, $($field)*),
            Level::DEBUG => tracing::event!(Level::DEBUG, $($field)*),
            _ => tracing::event!(Level::TRACE, $($field)*),
        }
    };
}

fn outcome_label(response: &Response) -> (&'static str, Option<i32>) {
    match response.outcome() {
        Outcome::Empty => ("empty", None),
        Outcome::Reply(_) => ("ok", None),
        Outcome::Error(error) => ("error", Some(error.code)),
    }
}

impl Stage for TraceStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn configure(&mut self, config: &StageConfig) -> Result<(), ConfigError> {
        if let Some(level) = config.get_str("level") {
            self.level = level.parse().map_err(|_| {
                ConfigError::invalid_value("level", format!("unknown level {level:?}"))
            })?;
        }
        Ok(())
    }

    fn process(&self, request: &Request, response: &mut Response, next: Next<'_>) {
        next.run(request, response);

        let (outcome, code) = outcome_label(response);
        let namespace = request
            .namespace()
            .map(ToString::to_string)
            .or_else(|| request.database().map(str::to_string))
            .unwrap_or_default();
        trace_event!(
            self.level,
            kind = %request.kind(),
            command = request.command_name().unwrap_or(""),
            namespace = %namespace,
            outcome,
            code,
            "request handled"
        );
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use mongoproxy_wire::{CommandError, FindRequest, Namespace};

    use super::*;

    struct Fail;

    impl Stage for Fail {
        fn name(&self) -> &str {
            "fail"
        }

        fn configure(&mut self, _config: &StageConfig) -> Result<(), ConfigError> {
            Ok(())
        }

        fn process(&self, _request: &Request, response: &mut Response, _next: Next<'_>) {
            response.write_error(CommandError::new(50, "time limit exceeded"));
        }
    }

    #[test]
    fn configure_parses_level() {
        let mut stage = TraceStage::default();
        let mut config = StageConfig::new();
        config.insert("level", "info");
        stage.configure(&config).unwrap();
        assert_eq!(stage.level(), Level::INFO);

        config.insert("level", "loud");
        assert!(stage.configure(&config).is_err());
    }

    #[test]
    fn observes_without_altering_the_outcome() {
        let rest: Vec<Box<dyn Stage>> = vec![Box::new(Fail)];
        let request = Request::Find(FindRequest::new(Namespace::new("db", "c"), doc! {}));
        let mut response = Response::new();

        TraceStage::default().process(&request, &mut response, Next::new(&rest));
        assert_eq!(outcome_label(&response), ("error", Some(50)));
    }
}
