use anyhow::Result;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Config;
use opentelemetry_sdk::Resource;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::FmtSubscriber;

/// Sets up tracing output. Without an OTLP endpoint the fmt
/// subscriber alone is installed; with one, spans are additionally
/// exported over OTLP so the `otel.*` span fields become trace
/// status and kind attributes.
pub fn setup_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    match otlp_endpoint {
        None => {
            let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint);
            let provider = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(Config::default().with_resource(Resource::new(vec![
                    KeyValue::new(
                        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                        "zonewalk",
                    ),
                ])))
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;
            let tracer = provider.tracer("zonewalk");
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
        }
    }
    Ok(())
}
