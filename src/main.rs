use azure_openai_gateway::config::GatewayConfig;
use azure_openai_gateway::handlers::handle_connection;
use azure_openai_gateway::tracing_util::redact_endpoint;

use smol::net::TcpListener;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> smol::io::Result<()> {
    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    smol::block_on(async {
        // 配置启动时构造一次，之后以 Arc 只读共享
        let config = match GatewayConfig::from_env() {
            Ok(config) => Arc::new(config),
            Err(err) => {
                error!("Failed to load gateway configuration: {}", err);
                std::process::exit(1);
            }
        };

        // 端口回退机制：尝试从指定端口开始，最多尝试10个端口
        let base_port = config.port;
        let mut listener = None;
        let mut used_port = 0;
        for port_offset in 0..10 {
            let port = base_port + port_offset;
            let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

            match TcpListener::bind(addr).await {
                Ok(l) => {
                    listener = Some(l);
                    used_port = port;
                    break;
                }
                Err(e) => {
                    warn!("端口 {} 被占用: {}, 尝试下一个端口", port, e);
                    continue;
                }
            }
        }

        if let Some(listener) = listener {
            info!(
                "Azure OpenAI Gateway 启动在 http://0.0.0.0:{}, 后端 {}",
                used_port,
                redact_endpoint(&config.endpoint)
            );

            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(s) => s,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let config = Arc::clone(&config);
                smol::spawn(async move {
                    handle_connection(stream, addr, config).await;
                })
                .detach();
            }
        } else {
            error!("无法绑定到任何端口，从 {} 到 {}", base_port, base_port + 9);
            std::process::exit(1);
        }
    })
}
