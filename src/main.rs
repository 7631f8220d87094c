use fetter::cli;
use fetter_core::logging;

fn main() {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    let logger = match logging::init(options.log_level()) {
        Ok(logger) => logger,
        Err(err) => {
            eprintln!("Failed to initialize logging: {err}");
            std::process::exit(1);
        }
    };

    match fetter::run(&options, &logger) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}
