use hls_fetch::JobStatus;
use log::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 解析命令行参数
    let args = hls_fetch::cli::parse_args();

    info!("Starting HLS downloader...");
    info!("URL: {}", args.url);

    match hls_fetch::run(args).await {
        Ok(JobStatus::Succeeded) => Ok(()),
        Ok(status) => {
            error!("Job {}.", status);
            std::process::exit(2);
        }
        Err(e) => {
            error!("An error occurred: {}", e);
            std::process::exit(1);
        }
    }
}
