use {
    crate::{
        cli::{generate_cli, ProgramArgs},
        error::MainResult,
        prelude::{CrateResult as Result, *},
    },
    lazy_static::lazy_static,
    tracing_futures::Instrument,
    tracing_subscriber::{EnvFilter, FmtSubscriber},
};

mod cli;
mod error;
mod recorder;
mod replay;
mod server;
mod tracker;
mod traffic;

mod prelude {
    pub use {
        crate::{
            cli, enter,
            error::{CrateError, CrateResult, LogError},
        },
        tracing::{
            debug, debug_span, error, error_span as always_span, info, info_span, instrument,
            trace, trace_span, warn, Level,
        },
    };
}

lazy_static! {
    pub static ref ARGS: Result<ProgramArgs> = ProgramArgs::try_init(generate_cli());
}

#[macro_export]
macro_rules! cli {
    () => {{
        use crate::ARGS;
        ARGS.as_ref().unwrap()
    }};
}

#[macro_export]
macro_rules! enter {
    ($span:expr) => {
        let span = $span;
        let _grd = span.enter();
    };
    ($var:ident, $span:expr) => {
        let $var = $span;
        let _grd = $var.enter();
    };
}

fn main() -> MainResult<()> {
    check_args()?;
    init_logging();
    enter!(always_span!("main"));
    info!("Program Args loaded");

    try_main().map_err(|e| e.into())
}

#[tokio::main]
async fn try_main() -> Result<()> {
    server::serve()
        .instrument(always_span!("listener.tcp"))
        .await
}

/// This function should be the first to deref ARGS,
/// giving the program a chance to bail if anything went wrong on initialization.
/// It is an invariant of this program that any call to ARGS after this call will never fail
fn check_args() -> MainResult<()> {
    match ARGS.as_ref() {
        Ok(_) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Initialize the global logger. Must run after check_args, as the `-l` and
/// `-L` flags feed the subscriber configuration
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match cli!().log_defaults() {
        Some(directives) => EnvFilter::new(directives),
        None => {
            EnvFilter::default().add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        }
    });

    match cli!().log_file() {
        Some(path) => {
            let file = std::fs::File::create(path).expect("Failed to open the log file");
            let root_subscriber = FmtSubscriber::builder()
                .with_writer(move || file.try_clone().expect("Failed to clone the log handle"))
                .with_env_filter(filter)
                .finish();
            tracing::subscriber::set_global_default(root_subscriber)
                .expect("Failed to init logging");
        }
        None => {
            let root_subscriber = FmtSubscriber::builder()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .finish();
            tracing::subscriber::set_global_default(root_subscriber)
                .expect("Failed to init logging");
        }
    }
    info!("<== Logs Start ==>")
}
