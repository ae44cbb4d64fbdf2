use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::Layer::default())
        .try_init()?;

    Ok(())
}
