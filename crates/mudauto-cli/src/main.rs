//! MUD 自動化引擎命令列工具
//!
//! 從標準輸入讀取資料驅動一個 session，輸出寫到標準輸出。

mod ansi;
mod app;

use std::path::PathBuf;

use app::App;
use mudauto::EngineConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 設定檔路徑：第一個參數，或使用者設定目錄下的 `mudauto/config.json`
fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| dirs::config_dir().map(|dir| dir.join("mudauto").join("config.json")))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // 初始化日誌
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match config_path() {
        Some(path) => match EngineConfig::load(&path) {
            Ok(config) => {
                info!("已載入設定: {}", path.display());
                config
            }
            Err(e) => {
                error!("設定檔 {} 載入失敗，使用預設值: {}", path.display(), e);
                EngineConfig::default()
            }
        },
        None => EngineConfig::default(),
    };

    let mut app = App::new(config);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        app.handle_line(&line);
                        for output in app.take_output() {
                            println!("{}", output);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("讀取輸入失敗: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("收到中斷信號");
                break;
            }
        }
    }

    app.shutdown();
    for output in app.take_output() {
        println!("{}", output);
    }
}
