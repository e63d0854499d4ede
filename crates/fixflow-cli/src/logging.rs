//! tracing の初期化
//!
//! `RUST_LOG` を読みます。未設定なら `info`。出力は stderr（stdout はコマンドの結果用）。
//!
//! ```bash
//! RUST_LOG=fixflow_core=debug,fixflow::events=info fixflow demo
//! ```

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
