//! Accelerator detection and the best-effort failure report sent when none is found.

use std::{env, error::Error, fmt, io, process::Command, time::Duration};

use log::{debug, error, info, warn};
use tokio::{io::AsyncWriteExt, net::TcpStream, time};

use crate::error::{InitErr, Result};

/// Where the failure report of a device-less host is sent.
pub const DIAGNOSTIC_ENDPOINT: &str = "10.0.0.4:4200";
const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(5);

/// The device inventory of the host a worker runs on.
pub trait Accelerator: Send {
    /// The amount of devices visible to this process.
    fn device_count(&self) -> usize;

    /// Binds this process to `device`.
    ///
    /// # Errors
    /// Returns an io error if the device is out of range.
    fn bind(&mut self, device: usize) -> io::Result<()>;

    /// The device this process is bound to, if any.
    fn current_device(&self) -> Option<usize>;

    /// Free form output of the local device management utility.
    fn diagnostics(&self) -> String;
}

/// Queries the NVIDIA driver through `nvidia-smi`.
#[derive(Debug)]
pub struct NvidiaSmi {
    devices: usize,
    current: Option<usize>,
}

impl NvidiaSmi {
    /// Counts the devices reported by `nvidia-smi --list-gpus`, narrowed by `CUDA_VISIBLE_DEVICES`.
    pub fn detect() -> Self {
        let physical = match Command::new("nvidia-smi").arg("--list-gpus").output() {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter(|line| line.starts_with("GPU "))
                .count(),
            Ok(out) => {
                debug!(status:? = out.status; "nvidia-smi exited unsuccessfully");
                0
            }
            Err(e) => {
                debug!("nvidia-smi not runnable: {e}");
                0
            }
        };

        let visible = env::var("CUDA_VISIBLE_DEVICES").ok();
        let devices = visible_count(physical, visible.as_deref());
        debug!(physical = physical, devices = devices; "detected devices");

        Self {
            devices,
            current: None,
        }
    }
}

impl Accelerator for NvidiaSmi {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn bind(&mut self, device: usize) -> io::Result<()> {
        if device >= self.devices {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("device {device} out of range, {} visible", self.devices),
            ));
        }

        self.current = Some(device);
        Ok(())
    }

    fn current_device(&self) -> Option<usize> {
        self.current
    }

    fn diagnostics(&self) -> String {
        match Command::new("nvidia-smi").output() {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                text
            }
            Err(e) => format!("nvidia-smi: {e}"),
        }
    }
}

/// Applies a `CUDA_VISIBLE_DEVICES` style mask to a physical device count.
fn visible_count(physical: usize, visible: Option<&str>) -> usize {
    let Some(mask) = visible else {
        return physical;
    };

    // The driver stops enumerating at the first invalid entry.
    let listed = mask
        .split(',')
        .map(str::trim)
        .take_while(|entry| {
            !entry.is_empty() && !entry.starts_with('-') && entry.parse::<usize>().is_ok()
        })
        .count();

    listed.min(physical)
}

/// The outcome of looking for devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Ready { devices: usize },
    Unavailable,
}

/// Looks for at least one usable device.
pub fn probe<A: Accelerator + ?Sized>(accelerator: &A) -> Probe {
    match accelerator.device_count() {
        0 => Probe::Unavailable,
        devices => Probe::Ready { devices },
    }
}

/// The failed delivery of a diagnostic report, logged and dropped by the caller.
#[derive(Debug)]
pub enum DiagnosticErr {
    Timeout(Duration),
    Io(io::Error),
}

impl fmt::Display for DiagnosticErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticErr::Timeout(after) => write!(f, "diagnostic send timed out after {after:?}"),
            DiagnosticErr::Io(e) => write!(f, "diagnostic send failed: {e}"),
        }
    }
}

impl Error for DiagnosticErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DiagnosticErr::Io(e) => Some(e),
            DiagnosticErr::Timeout(_) => None,
        }
    }
}

/// Checks the host's devices and reports a missing accelerator before giving up.
pub struct Prober {
    endpoint: String,
    timeout: Duration,
}

impl Default for Prober {
    fn default() -> Self {
        Self::with_endpoint(DIAGNOSTIC_ENDPOINT)
    }
}

impl Prober {
    /// Creates a `Prober` reporting to a different endpoint.
    pub fn with_endpoint<S: Into<String>>(endpoint: S) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DIAGNOSTIC_TIMEOUT,
        }
    }

    /// Makes sure the job can run on this host.
    ///
    /// # Arguments
    /// * `accelerator` - The host's device inventory.
    /// * `required` - Whether a device-less host is fatal or degrades to a single stream job.
    ///
    /// # Returns
    /// The amount of visible devices, zero only when `required` is false.
    ///
    /// # Errors
    /// Returns `InitErr::AcceleratorUnavailable` if no device is found and one is required.
    pub async fn ensure_ready<A: Accelerator + ?Sized>(
        &self,
        accelerator: &A,
        required: bool,
    ) -> Result<usize> {
        match probe(accelerator) {
            Probe::Ready { devices } => {
                info!(devices = devices; "accelerator ready");
                Ok(devices)
            }
            Probe::Unavailable if !required => {
                warn!("no accelerator found, continuing in degraded single stream mode");
                Ok(0)
            }
            Probe::Unavailable => {
                let report = format!("no nvidia {}", accelerator.diagnostics());

                if let Err(e) = self.report(&report).await {
                    warn!(endpoint = self.endpoint.as_str(); "couldn't send message: {e}");
                }

                error!("no accelerator found, this job requires one");
                Err(InitErr::AcceleratorUnavailable)
            }
        }
    }

    /// Sends `text` once to the diagnostic endpoint, non ascii characters are replaced.
    pub async fn report(&self, text: &str) -> std::result::Result<(), DiagnosticErr> {
        let ascii: String = text
            .chars()
            .map(|c| if c.is_ascii() { c } else { '?' })
            .collect();

        let send = async {
            let mut stream = TcpStream::connect(&self.endpoint).await?;
            stream.write_all(ascii.as_bytes()).await?;
            stream.shutdown().await
        };

        match time::timeout(self.timeout, send).await {
            Ok(res) => res.map_err(DiagnosticErr::Io),
            Err(_) => Err(DiagnosticErr::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncReadExt, net::TcpListener};

    use super::*;
    use crate::testing::free_port;

    struct Fixed(usize);

    impl Accelerator for Fixed {
        fn device_count(&self) -> usize {
            self.0
        }

        fn bind(&mut self, _device: usize) -> io::Result<()> {
            Ok(())
        }

        fn current_device(&self) -> Option<usize> {
            None
        }

        fn diagnostics(&self) -> String {
            "NVIDIA-SMI has failed: pilote non chargé".into()
        }
    }

    #[test]
    fn visible_mask_narrows_devices() {
        assert_eq!(visible_count(4, None), 4);
        assert_eq!(visible_count(4, Some("0,2")), 2);
        assert_eq!(visible_count(4, Some("")), 0);
        assert_eq!(visible_count(4, Some("1,-1,2")), 1);
        assert_eq!(visible_count(2, Some("0,1,2,3")), 2);
    }

    #[test]
    fn probe_needs_a_device() {
        assert_eq!(probe(&Fixed(0)), Probe::Unavailable);
        assert_eq!(probe(&Fixed(2)), Probe::Ready { devices: 2 });
    }

    #[tokio::test]
    async fn missing_device_is_reported_then_fatal() {
        let list = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let prober = Prober::with_endpoint(list.local_addr().unwrap().to_string());

        let collector = tokio::spawn(async move {
            let (mut stream, _) = list.accept().await.unwrap();
            let mut received = String::new();
            stream.read_to_string(&mut received).await.unwrap();
            received
        });

        let err = prober.ensure_ready(&Fixed(0), true).await.unwrap_err();
        assert!(matches!(err, InitErr::AcceleratorUnavailable));

        let received = collector.await.unwrap();
        assert!(received.starts_with("no nvidia NVIDIA-SMI has failed"));
        assert!(received.is_ascii());
    }

    #[tokio::test]
    async fn unreachable_report_is_swallowed() {
        let prober = Prober::with_endpoint(format!("127.0.0.1:{}", free_port()));

        assert!(prober.report("no nvidia").await.is_err());

        let err = prober.ensure_ready(&Fixed(0), true).await.unwrap_err();
        assert!(matches!(err, InitErr::AcceleratorUnavailable));
    }

    #[tokio::test]
    async fn degraded_mode_skips_the_report() {
        let prober = Prober::with_endpoint("127.0.0.1:1");
        assert_eq!(prober.ensure_ready(&Fixed(0), false).await.unwrap(), 0);
    }
}
