//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use wfrun_observe::tracing_setup::{TracingOptions, init_tracing};
//!
//! // Warnings only, human-readable output on stderr
//! init_tracing(&TracingOptions::default()).unwrap();
//! ```
//!
//! ```no_run
//! use wfrun_observe::tracing_setup::{TracingOptions, init_tracing};
//!
//! // Debug logging for the engine, JSON lines, spans exported to stdout
//! init_tracing(&TracingOptions {
//!     directive: "info,wfrun=debug".into(),
//!     json: true,
//!     otel: true,
//! })
//! .unwrap();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Tracer name registered with OpenTelemetry.
pub const TRACER_NAME: &str = "wfrun";

/// Subscriber settings chosen by the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    /// Fallback filter directive used when `RUST_LOG` is unset.
    pub directive: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
    /// Bridge spans to OpenTelemetry with a stdout exporter.
    pub otel: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            directive: "warn".to_string(),
            json: false,
            otel: false,
        }
    }
}

/// Map CLI verbosity flags to a filter directive.
pub fn verbosity_directive(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,wfrun=debug",
        _ => "trace",
    }
}

fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

/// Initialize the global tracing subscriber.
///
/// - Always installs a `fmt` layer on stderr, so command output on stdout
///   stays machine-readable.
/// - When `otel` is set, additionally bridges tracing spans to OpenTelemetry
///   using a stdout exporter.
/// - `RUST_LOG` takes precedence over `directive`.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing(options: &TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);
    let fmt_layer = if options.json {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.boxed()
    };

    let otel_layer = if options.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(TRACER_NAME);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter(&options.directive))
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
