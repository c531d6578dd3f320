//! loaf_rater CLI - 猫の香箱座り写真の保存・学習・評価

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use loaf_rater_lib::ml::backend::{cpu_device, CpuTrainBackend};
use loaf_rater_lib::model::{AppConfig, DeviceType};
use loaf_rater_lib::service::{LoafService, TrainingStatus};
use loaf_rater_lib::types::{Bucket, Category, Rating};

#[derive(Parser)]
#[command(name = "loaf_rater")]
#[command(version)]
#[command(about = "Rate how well a cat is loafing", long_about = None)]
struct Cli {
    /// 設定ファイルのパス (default: config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// デバッグログを出力
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CategoryArg {
    Loaf,
    NotLoaf,
}

impl From<CategoryArg> for Category {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Loaf => Category::Loaf,
            CategoryArg::NotLoaf => Category::NotLoaf,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// ラベル付きで画像を保存
    Store {
        /// 画像ファイル
        image: PathBuf,

        /// 評価 (1-10, 範囲外は丸める)
        #[arg(short, long, conflicts_with = "category", required_unless_present = "category")]
        rating: Option<i64>,

        /// 分類ラベル
        #[arg(long, value_enum)]
        category: Option<CategoryArg>,
    },

    /// 保存済み画像をラベルごとに一覧表示
    List,

    /// 保存済み画像でモデルを学習 (Ctrl+C で次のエポック境界で停止)
    Train,

    /// 画像を評価
    #[command(alias = "analyze")]
    Predict {
        /// 画像ファイル
        image: PathBuf,
    },

    /// 現在の設定を表示
    Config {
        /// 設定ファイルに書き出す
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load_or_default_from(&config_path);

    match config.device_type {
        DeviceType::Cpu => run::<CpuTrainBackend>(cli.command, config, cpu_device(), &config_path).await,
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            use loaf_rater_lib::ml::backend::{wgpu_device, WgpuTrainBackend};
            run::<WgpuTrainBackend>(cli.command, config, wgpu_device(), &config_path).await
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            anyhow::bail!("WGPU バックエンドは無効です。`--features wgpu` でビルドするか device_type を Cpu にしてください")
        }
    }
}

async fn run<B: AutodiffBackend>(
    command: Commands,
    config: AppConfig,
    device: B::Device,
    config_path: &Path,
) -> Result<()> {
    let service = LoafService::<B>::new(config, device);

    match command {
        Commands::Config { save } => {
            let config = service.config();
            config.display();
            println!("{}", serde_json::to_string_pretty(config)?);
            if save {
                config.save(config_path)?;
                info!("設定ファイルを保存しました: {}", config_path.display());
            }
        }

        Commands::Store { image, rating, category } => {
            let bucket = match (rating, category) {
                (Some(rating), _) => Bucket::Rating(Rating::clamped(rating)),
                (None, Some(category)) => Bucket::Category(category.into()),
                (None, None) => anyhow::bail!("--rating か --category を指定してください"),
            };
            let bytes = read_image(&image)?;
            let path = service.store(&bytes, bucket)?;
            println!("{}", path.display());
        }

        Commands::List => {
            let listing = service.list_by_bucket()?;
            if listing.is_empty() {
                println!("保存済みの画像はありません: {}", service.image_store().root().display());
            }
            for (bucket, paths) in listing {
                println!("{} ({} 枚)", bucket, paths.len());
                for path in paths {
                    println!("  {}", path.display());
                }
            }
        }

        Commands::Train => {
            service.start_training()?;
            println!("学習中... Ctrl+C で停止");

            let wait = service.wait_for_training();
            tokio::pin!(wait);
            let mut cancel_requested = false;
            let status = loop {
                tokio::select! {
                    status = &mut wait => break status,
                    _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                        println!("\n現在のエポックが終わり次第停止します...");
                        service.cancel_training();
                        cancel_requested = true;
                    }
                }
            };

            match status {
                TrainingStatus::Succeeded {
                    final_loss,
                    num_samples,
                    epochs,
                } => {
                    println!(
                        "学習完了: {} 枚, {} エポック, final_loss = {:.6}",
                        num_samples, epochs, final_loss
                    );
                }
                TrainingStatus::Cancelled => println!("学習はキャンセルされました（モデルは更新されていません）"),
                TrainingStatus::Failed { message } => anyhow::bail!(message),
                other => anyhow::bail!("予期しない学習状態: {:?}", other),
            }
        }

        Commands::Predict { image } => {
            let bytes = read_image(&image)?;
            let prediction = service.predict(&bytes)?;
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("画像を読み込めません: {}", path.display()))
}
