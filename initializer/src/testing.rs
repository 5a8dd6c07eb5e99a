use std::io;

use crate::{
    config::{BackendKind, Configuration},
    probe::Accelerator,
};

/// A host with a fixed amount of devices.
pub struct FakeAccelerator {
    devices: usize,
    current: Option<usize>,
}

impl FakeAccelerator {
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            current: None,
        }
    }
}

impl Accelerator for FakeAccelerator {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn bind(&mut self, device: usize) -> io::Result<()> {
        if device >= self.devices {
            return Err(io::Error::other(format!("no device {device}")));
        }

        self.current = Some(device);
        Ok(())
    }

    fn current_device(&self) -> Option<usize> {
        self.current
    }

    fn diagnostics(&self) -> String {
        format!("{} fake devices", self.devices)
    }
}

/// A port nothing listens on right now.
pub fn free_port() -> u16 {
    let list = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    list.local_addr().unwrap().port()
}

pub fn loopback_config(rank: usize, world_size: usize, port: u16) -> Configuration {
    Configuration {
        rank,
        world_size,
        master_addr: "127.0.0.1".into(),
        master_port: port,
        distributed_backend: BackendKind::Gloo,
        ..Default::default()
    }
}
