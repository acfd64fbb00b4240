use std::time::Duration;

use application::Application;
use log::LevelFilter;
use simplelog::{ConfigBuilder, SimpleLogger};

mod application;

#[tokio::main]
pub async fn main() {
    let _ = SimpleLogger::init(
        LevelFilter::Info,
        ConfigBuilder::new()
            .add_filter_ignore_str("conclave::transport")
            .build(),
    );

    let number_of_nodes_to_start: u16 = std::env::args()
        .find_map(|arg| arg.parse::<u16>().ok().filter(|n| n > &0 && n <= &100))
        .unwrap_or(6);

    log::info!("Starting {} Conclave nodes", number_of_nodes_to_start);
    let app = match Application::start(number_of_nodes_to_start).await {
        Ok(app) => app,
        Err(err) => {
            log::error!("Could not start the demo: {}", err);
            return;
        }
    };

    let mut report = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    log::error!("Could not listen for ctrl-c: {}", err);
                }
                break;
            },
            _ = report.tick() => app.report().await,
        }
    }

    app.shutdown().await;
}
