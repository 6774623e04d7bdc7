pub mod config;
pub mod context;
pub mod core;
pub mod data;
pub mod gdf;
pub mod models;
pub mod trainers;

// Re-export common types
pub use config::{load_config, RawRunConfig, RunConfig};
pub use context::{Collective, ExecutionContext, SingleProcess};

pub mod logging {
    use log::LevelFilter;
    use env_logger::Builder;
    use std::io::Write;

    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .init();
    }
}
