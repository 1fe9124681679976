use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

use qcm_core::connection::Transport;
use qcm_core::frame::Codec;
use qcm_core::qmi::{QmiCodec, QmiRequestOps};
use qcm_core::{Backend, EngineClient, RequestOps, TransportError};

/// One read returns one whole QMUX message on cdc-wdm devices.
const READ_BUFFER_SIZE: usize = 4096 * 4;

/// A `/dev/cdc-wdmN` style control node, read and written without blocking
/// the runtime.
pub struct CharDeviceTransport {
    fd: AsyncFd<File>,
}

impl CharDeviceTransport {
    pub fn open(path: &Path) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(path)?;
        info!("Opened {}", path.display());
        Ok(Self {
            fd: AsyncFd::new(file)?,
        })
    }
}

#[async_trait]
impl Transport for CharDeviceTransport {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let mut written = 0;
        while written < frame.len() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(&frame[written..])
            }) {
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    async fn read(&self) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::zeroed(READ_BUFFER_SIZE);
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(&mut buf)
            }) {
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf.freeze());
                }
                // The node disappears under us when the modem drops off the bus.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::ENODEV) => {
                    return Err(TransportError::Closed);
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// QMI over a character device. Every session attempt reopens the node.
pub struct QmiBackend {
    path: PathBuf,
}

impl QmiBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Backend for QmiBackend {
    fn codec(&self) -> Arc<dyn Codec> {
        Arc::new(QmiCodec)
    }

    async fn open(&self) -> Result<Arc<dyn Transport>, TransportError> {
        debug!("Opening QMI device {}", self.path.display());
        let transport = CharDeviceTransport::open(&self.path)?;
        Ok(Arc::new(transport))
    }

    fn bind(&self, engine: EngineClient) -> Box<dyn RequestOps> {
        Box::new(QmiRequestOps::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_node_fails() {
        let backend = QmiBackend::new("/dev/qcm-test-no-such-node");
        match backend.open().await {
            Err(TransportError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("opened a node that does not exist"),
        }
    }
}
