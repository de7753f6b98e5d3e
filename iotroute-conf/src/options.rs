use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "iotroute", about = "Sensor telemetry router")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Directory holding the repository snapshot files (accounts.json, sensors.json, ...)
    #[structopt(name = "data-dir", long)]
    pub data_dir: Option<String>,

    /// Log level override (trace, debug, info, warning, error)
    #[structopt(name = "log-level", long)]
    pub log_level: Option<String>,
}
