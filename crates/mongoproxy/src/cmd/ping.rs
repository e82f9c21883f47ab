use std::time::{Duration, Instant};

use bson::{doc, Bson};
use mongoproxy_backend::{reply_ok, Client, ConnectOptions, MongoClient};
use tracing::debug;

use crate::cmd::PingArgs;
use crate::exit::{backend_error, CliError, CliResult, FAILURE, SUCCESS, USAGE};
use crate::output::{millis, print_ping, OutputFormat, PingOutput};

pub fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let options = ConnectOptions {
        addresses: vec![args.address.clone()],
        direct: true,
        timeout,
        max_pool_size: 1,
        ..ConnectOptions::default()
    };
    let context = format!("connect to {} failed", args.address);

    // Connecting covers server selection and the isMaster round trip.
    let started = Instant::now();
    let client = MongoClient::connect(&options).map_err(|err| backend_error(&context, err))?;
    let mut session = client
        .start_session()
        .map_err(|err| backend_error(&context, err))?;
    let hello = session
        .run_command("admin", doc! { "isMaster": 1 })
        .map_err(|err| backend_error("isMaster failed", err))?;
    let connect_ms = millis(started.elapsed());

    let started = Instant::now();
    let reply = session
        .run_command("admin", doc! { "ping": 1 })
        .map_err(|err| backend_error("ping failed", err))?;
    let ping_ms = millis(started.elapsed());
    debug!(reply = %reply, "ping reply");

    let out = PingOutput {
        address: args.address,
        connect_ms,
        ping_ms,
        ok: reply_ok(&reply),
        hello: Bson::Document(hello).into_relaxed_extjson(),
    };
    print_ping(&out, format);

    Ok(if out.ok { SUCCESS } else { FAILURE })
}

fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "timeout must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timeout_seconds() {
        assert_eq!(parse_timeout("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_timeout("2").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn parse_timeout_millis() {
        assert_eq!(parse_timeout("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn parse_timeout_invalid() {
        assert_eq!(parse_timeout("0s").unwrap_err().code, USAGE);
        assert!(parse_timeout("bad").is_err());
        assert!(parse_timeout("  ").is_err());
    }
}
