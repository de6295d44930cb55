use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use adscope::api::ApiClient;
use adscope::config;
use adscope::image_proxy::ImageSource;
use adscope::pager::PageLoader;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Page through the ad library, warming neighbouring pages in the background"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// First page to show (1-based)
    #[arg(long, default_value = "1")]
    page: u32,

    /// How many consecutive pages to walk
    #[arg(long, default_value = "1")]
    pages: u32,

    /// Override the configured collection
    #[arg(long)]
    collection: Option<String>,
}

fn field<'a>(item: &'a Value, name: &str) -> Option<&'a str> {
    item.get(name).and_then(Value::as_str)
}

fn describe(item: &Value, proxy: Option<&Url>) -> String {
    let title = field(item, "advertiser_name")
        .or_else(|| field(item, "title"))
        .unwrap_or("(untitled)");
    match field(item, "image_url") {
        Some(url) => format!("{}  {}", title, ImageSource::new(url, proxy).primary()),
        None => title.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let proxy = cfg
        .api
        .image_proxy
        .as_deref()
        .map(Url::parse)
        .transpose()
        .context("invalid api.image_proxy")?;

    let api = ApiClient::from_config(&cfg)?;
    let collection = args
        .collection
        .clone()
        .unwrap_or_else(|| cfg.library.collection.clone());
    let loader: PageLoader<Value> =
        PageLoader::new(Arc::new(api.collection(collection.clone())), cfg.pager());

    let mut page = args.page.max(1);
    for _ in 0..args.pages.max(1) {
        let was_cached = loader.cached(page).is_some();
        let loaded = loader.navigate(page).await?;
        info!(page, cached = was_cached, items = loaded.items.len(), "page ready");

        let pagination = loader.pagination();
        match pagination {
            Some(p) => println!("== {} page {}/{} ({} items)", collection, page, p.total_pages(), p.total),
            None => println!("== {} page {}", collection, page),
        }
        for item in &loaded.items {
            println!("  {}", describe(item, proxy.as_ref()));
        }

        if !pagination.map(|p| p.can_go_next()).unwrap_or(false) {
            break;
        }
        page += 1;
    }

    loader.close();
    Ok(())
}
