//! Builder for the Firecracker process's CLI invocation.

use std::path::PathBuf;

/// Where the VMM's API socket lives. `Disabled` corresponds to `--no-api`.
#[derive(Debug, Clone)]
pub enum VmmApiSocket {
    Disabled,
    Enabled(PathBuf),
}

/// Arguments used to build the Firecracker process's command line. Mirrors
/// only the options this crate's supervisor actually sets.
#[derive(Debug, Clone)]
pub struct VmmArguments {
    api_socket: VmmApiSocket,
    log_path: Option<PathBuf>,
    id: Option<String>,
}

impl VmmArguments {
    pub fn new(api_socket: VmmApiSocket) -> Self {
        Self {
            api_socket,
            log_path: None,
            id: None,
        }
    }

    pub fn log_path(mut self, log_path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(log_path.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Render into the argv Firecracker expects, not including argv\[0\].
    pub fn join(&self) -> Vec<String> {
        let mut args = Vec::new();

        match &self.api_socket {
            VmmApiSocket::Disabled => args.push("--no-api".to_string()),
            VmmApiSocket::Enabled(path) => {
                args.push("--api-sock".to_string());
                args.push(path.to_string_lossy().into_owned());
            }
        }

        if let Some(ref log_path) = self.log_path {
            args.push("--log-path".to_string());
            args.push(log_path.to_string_lossy().into_owned());
        }

        if let Some(ref id) = self.id {
            args.push("--id".to_string());
            args.push(id.clone());
        }

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_api_socket_and_log_path() {
        let args = VmmArguments::new(VmmApiSocket::Enabled(PathBuf::from("/tmp/x.sock")))
            .log_path("/tmp/x.log")
            .id("vm-1")
            .join();
        assert_eq!(
            args,
            vec!["--api-sock", "/tmp/x.sock", "--log-path", "/tmp/x.log", "--id", "vm-1"]
        );
    }

    #[test]
    fn renders_disabled_api_socket() {
        let args = VmmArguments::new(VmmApiSocket::Disabled).join();
        assert_eq!(args, vec!["--no-api"]);
    }
}
