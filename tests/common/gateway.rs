use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// The gateway binary under test, spawned with an environment pointing at a
/// mock backend.
pub struct GatewayProcess {
    child: Child,
}

impl GatewayProcess {
    pub fn start(endpoint: &str, port: u16, extra_env: &[(&str, &str)]) -> Self {
        let binary = env!("CARGO_BIN_EXE_azure-openai-gateway");
        let mut command = Command::new(binary);
        command
            .env("AZURE_OPENAI_ENDPOINT", endpoint)
            .env("AZURE_OPENAI_API_VER", "2023-03-15-preview")
            .env("GATEWAY_PORT", port.to_string())
            .env("RUST_LOG", "warn")
            .env_remove("AZURE_OPENAI_TOKEN")
            .env_remove("AZURE_OPENAI_MODEL_MAPPER")
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        for (key, value) in extra_env {
            command.env(key, value);
        }

        let mut child = command.spawn().expect("failed to launch gateway process");

        if !wait_for_gateway(&mut child, port, Duration::from_secs(5)) {
            let _ = child.kill();
            panic!("gateway failed to start on port {}", port);
        }

        Self { child }
    }

    /// True while the process has not exited.
    pub fn is_running(&mut self) -> bool {
        self.child.try_wait().ok().flatten().is_none()
    }
}

impl Drop for GatewayProcess {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

fn wait_for_gateway(child: &mut Child, port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        if let Some(status) = child.try_wait().expect("failed to poll child process") {
            panic!("gateway process exited prematurely: {}", status);
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}
