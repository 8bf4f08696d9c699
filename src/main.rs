//! Binary entry point for the `flexvol` FlexVolume driver.
//!
//! Whatever happens, the process prints exactly one JSON response on stdout
//! and exits with status zero; the kubelet reads the outcome from the JSON.
//! Help and version text go to stderr.

use std::env;
use std::io::{self, Write};

use flexvol::{
    DnsResolver, DriverConfig, DriverResponse, FlexDriver, Invocation, OpenStackConnector,
    ProcessCommandRunner, binary_name, logging, parse_invocation,
};

const USAGE_ON_STDERR: &str = "no operation requested; usage written to stderr";

#[tokio::main]
async fn main() {
    let args: Vec<_> = env::args_os().collect();
    let binary = binary_name(args.first());

    let response = match parse_invocation(args) {
        Invocation::Help(err) => {
            write_stderr(err.render().to_string().trim_end());
            DriverResponse::failure(USAGE_ON_STDERR)
        }
        Invocation::Respond(response) => response,
        Invocation::Run(operation) => match DriverConfig::load_without_cli_args() {
            Ok(config) => {
                logging::init(&config, &binary);
                let driver = FlexDriver::new(
                    OpenStackConnector::from_environment(),
                    ProcessCommandRunner,
                    DnsResolver,
                    config,
                    &binary,
                );
                driver.dispatch(operation).await
            }
            Err(err) => DriverResponse::failure(format!("configuration error: {err}")),
        },
    };

    write_response(io::stdout().lock(), &response);
}

fn write_response(mut target: impl Write, response: &DriverResponse) {
    if let Err(err) = writeln!(target, "{}", response.to_json()) {
        write_stderr(&err.to_string());
    }
}

fn write_stderr(message: &str) {
    writeln!(io::stderr(), "{message}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_is_written_as_one_json_line() {
        let mut buf = Vec::new();
        write_response(&mut buf, &DriverResponse::success().with_device("/dev/dm-3"));
        let rendered = String::from_utf8(buf).expect("utf8");
        assert_eq!(
            rendered,
            "{\"status\":\"Success\",\"message\":\"Operation Success\",\"device\":\"/dev/dm-3\"}\n"
        );
    }
}
