use std::sync::Arc;
use std::time::Duration;

use ::url::Url;
use anyhow::Result;
use clap::Parser;
use tempfile::TempDir;

use flowtrace::{
    browser::{Browser, BrowserOptions, ChromiumPage, session_feed},
    config::CaptureOptions,
    emitter::{CollectorEmitter, EventSink},
    interceptor::CaptureLayer,
    proxy::start_proxy,
    recorder::Recorder,
};

#[derive(Parser)]
#[command(version, about)]
struct CLI {
    /// Where capture events are posted.
    #[arg(long, global = true, env = "FLOWTRACE_COLLECTOR_URL")]
    collector_url: Option<Url>,
    #[arg(long, global = true, env = "FLOWTRACE_SESSION_ID")]
    session_id: Option<String>,
    #[arg(long, global = true)]
    snapshot_timeout_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Opens `url` and clicks the given selectors, one action each.
    Visit {
        url: Url,
        #[arg(long)]
        click: Vec<String>,
        #[arg(long, default_value_t = false)]
        headless: bool,
        #[arg(long, default_value_t = false)]
        no_sandbox: bool,
        #[arg(long, default_value_t = 1024)]
        width: u16,
        #[arg(long, default_value_t = 768)]
        height: u16,
    },
    Proxy {
        #[arg(long)]
        port: u16,
    },
}

impl CLI {
    fn capture_options(&self) -> CaptureOptions {
        let mut options = CaptureOptions::default();
        if let Some(collector_url) = &self.collector_url {
            options.collector_url = collector_url.clone();
        }
        if let Some(session_id) = &self.session_id {
            options.session_id = session_id.clone();
        }
        if let Some(timeout) = self.snapshot_timeout_ms {
            options.snapshot_timeout = Duration::from_millis(timeout);
        }
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_target(true)
        .init();
    let cli = CLI::parse();
    let capture_options = cli.capture_options();
    log::info!(
        "session {} reporting to {}",
        capture_options.session_id,
        capture_options.collector_url
    );
    match cli.command {
        Command::Visit {
            url,
            click,
            headless,
            no_sandbox,
            width,
            height,
        } => {
            let user_data_directory = TempDir::new()?;
            let browser_options = BrowserOptions {
                headless,
                user_data_directory: user_data_directory.path().to_path_buf(),
                width,
                height,
                no_sandbox,
            };
            match visit(url, &click, &browser_options, capture_options).await
            {
                Ok(()) => Ok(()),
                Err(error) => {
                    eprintln!("{:#}", error);
                    std::process::exit(2);
                }
            }
        }
        Command::Proxy { port } => {
            let emitter = Arc::new(CollectorEmitter::new(&capture_options));
            start_proxy(port, CaptureLayer::new(emitter, capture_options))
                .await
        }
    }
}

async fn visit(
    url: Url,
    selectors: &[String],
    browser_options: &BrowserOptions,
    capture_options: CaptureOptions,
) -> Result<()> {
    let browser = Browser::launch(browser_options).await?;
    let page = browser.page.clone();
    let emitter = Arc::new(CollectorEmitter::new(&capture_options));
    let recorder = Recorder::start(
        Arc::new(ChromiumPage::new(page.clone())),
        emitter.clone() as Arc<dyn EventSink>,
        capture_options,
        session_feed(&page).await?,
    );

    let result = async {
        let title = format!("Navigate to {}", url);
        recorder
            .instrument("Frame", "goto", title, async {
                page.goto(url.as_str()).await?;
                anyhow::Ok(())
            })
            .await?;
        for selector in selectors {
            recorder
                .instrument(
                    "Frame",
                    "click",
                    format!("Click {}", selector),
                    async {
                        page.find_element(selector.as_str())
                            .await?
                            .click()
                            .await?;
                        anyhow::Ok(())
                    },
                )
                .await?;
        }
        anyhow::Ok(())
    }
    .await;

    recorder.terminate().await?;
    emitter.flush().await;
    browser.terminate().await?;
    result
}
