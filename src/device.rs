// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM transport layer
//!
//! The [`Transport`] trait is the single seam between the command pipeline and
//! a TPM. [`TpmDevice`] implements it for character devices (`/dev/tpmrm0`,
//! `/dev/tpm0`) and for Unix sockets speaking the raw command protocol.

use anyhow::{bail, Context};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use super::constants::*;
use super::error::{Error, Result};
use super::marshal::*;
use super::rc::TpmRc;

/// Maximum TPM command/response size
pub const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// Size of the command and response headers
pub const HEADER_SIZE: usize = 10;

/// A synchronous request/response channel to a TPM
pub trait Transport {
    /// Send one marshalled command and return the full response
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        (**self).send(command)
    }
}

enum Channel {
    Device(File),
    Socket(UnixStream),
}

/// TPM device handle
pub struct TpmDevice {
    channel: Channel,
    path: String,
}

impl TpmDevice {
    /// Open a TPM by spec: `device:<path>`, `socket:<path>` or a bare device path.
    ///
    /// The TPM must answer a one-byte TPM2_GetRandom before the device is
    /// handed out.
    pub fn open(spec: &str) -> Result<Self> {
        let mut device = match spec.strip_prefix("socket:") {
            Some(path) => Self::open_socket(path)?,
            None => Self::open_device(spec.strip_prefix("device:").unwrap_or(spec))?,
        };
        device.check_alive().map_err(|e| {
            anyhow::Error::new(e).context(format!("TPM at {} did not answer", device.path))
        })?;
        tracing::debug!(path = %device.path, "TPM is responding");
        Ok(device)
    }

    fn check_alive(&mut self) -> Result<()> {
        let mut buf = CommandBuffer::new();
        put_command_header(&mut buf, TpmSt::NoSessions, TpmCc::GetRandom);
        buf.put_u16(1);
        let response = self.transmit(&finalize_command(buf))?;
        ResponseHeader::parse(&response)?.ensure_success()
    }

    fn open_device(device_path: &str) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .with_context(|| format!("failed to open TPM device: {}", device_path))?;

        Ok(Self {
            channel: Channel::Device(file),
            path: device_path.to_string(),
        })
    }

    fn open_socket(socket_path: &str) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .with_context(|| format!("failed to connect to TPM socket: {}", socket_path))?;

        Ok(Self {
            channel: Channel::Socket(stream),
            path: socket_path.to_string(),
        })
    }

    /// Detect and open the default TPM device
    pub fn detect() -> Result<Self> {
        if Path::new("/dev/tpmrm0").exists() {
            Self::open("/dev/tpmrm0")
        } else if Path::new("/dev/tpm0").exists() {
            Self::open("/dev/tpm0")
        } else {
            Err(anyhow::anyhow!("TPM device not found").into())
        }
    }

    /// Get the device path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Send a command to the TPM and receive the response
    pub fn transmit(&mut self, command: &[u8]) -> anyhow::Result<Vec<u8>> {
        match &mut self.channel {
            Channel::Device(file) => {
                file.write_all(command)
                    .context("failed to write TPM command")?;
                read_response(file)
            }
            Channel::Socket(stream) => {
                stream
                    .write_all(command)
                    .context("failed to write TPM command")?;
                read_response(stream)
            }
        }
    }
}

/// Read one response, however many reads the channel splits it into
fn read_response(reader: &mut impl Read) -> anyhow::Result<Vec<u8>> {
    let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
    let mut filled = 0;
    loop {
        let n = match reader.read(&mut response[filled..]) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("failed to read TPM response"),
        };
        if n == 0 {
            bail!("TPM channel closed after {} response bytes", filled);
        }
        filled += n;
        if filled < HEADER_SIZE {
            continue;
        }
        let size =
            u32::from_be_bytes([response[2], response[3], response[4], response[5]]) as usize;
        if !(HEADER_SIZE..=TPM_MAX_COMMAND_SIZE).contains(&size) {
            bail!("TPM response size out of range: {}", size);
        }
        if filled >= size {
            response.truncate(filled);
            return Ok(response);
        }
    }
}

impl Transport for TpmDevice {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        tracing::trace!(len = command.len(), path = %self.path, "sending TPM command");
        Ok(self.transmit(command)?)
    }
}

/// Write a command header with a size placeholder
pub fn put_command_header(buf: &mut CommandBuffer, tag: TpmSt, command_code: TpmCc) {
    buf.put_u16(tag.to_u16());
    buf.put_u32(0); // Size placeholder
    buf.put_u32(command_code.to_u32());
}

/// Patch the size field once the command is complete
pub fn finalize_command(mut buf: CommandBuffer) -> Vec<u8> {
    let size = buf.len() as u32;
    buf.update_u32(2, size);
    buf.into_vec()
}

/// Parsed response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub tag: TpmSt,
    pub size: u32,
    pub response_code: TpmRc,
}

impl ResponseHeader {
    /// Parse the header and check the declared size against the bytes received
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < HEADER_SIZE {
            return Err(Error::InvalidResponseHeader(format!(
                "TPM response too short: {} bytes",
                response.len()
            )));
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw).ok_or_else(|| {
            Error::InvalidResponseHeader(format!("invalid response tag: 0x{:04x}", tag_raw))
        })?;

        let size = buf.get_u32()?;
        if response.len() != size as usize {
            return Err(Error::ResponseSizeMismatch {
                declared: size,
                actual: response.len(),
            });
        }

        let response_code = TpmRc(buf.get_u32()?);

        Ok(Self {
            tag,
            size,
            response_code,
        })
    }

    /// Check if the response indicates success
    pub fn is_success(&self) -> bool {
        self.response_code.is_success()
    }

    /// Ensure the response is successful
    pub fn ensure_success(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::Tpm(self.response_code))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_command_header() {
        let mut buf = CommandBuffer::new();
        put_command_header(&mut buf, TpmSt::NoSessions, TpmCc::GetRandom);
        buf.put_u16(32); // Request 32 random bytes

        let bytes = finalize_command(buf);

        assert_eq!(&bytes[0..2], &[0x80, 0x01]); // TPM_ST_NO_SESSIONS
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x7B]); // TPM_CC_GetRandom

        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
    }

    #[test]
    fn test_response_parse() {
        // Minimal success response
        let response = vec![
            0x80, 0x01, // TPM_ST_NO_SESSIONS
            0x00, 0x00, 0x00, 0x0A, // Size = 10
            0x00, 0x00, 0x00, 0x00, // TPM_RC_SUCCESS
        ];

        let parsed = ResponseHeader::parse(&response).unwrap();
        assert!(parsed.is_success());
        assert_eq!(parsed.tag, TpmSt::NoSessions);
    }

    #[test]
    fn test_response_parse_errors() {
        let short = [0x80, 0x01, 0x00];
        assert!(matches!(
            ResponseHeader::parse(&short),
            Err(Error::InvalidResponseHeader(_))
        ));

        let bad_size = [0x80, 0x01, 0x00, 0x00, 0x00, 0x20, 0, 0, 0, 0];
        assert!(matches!(
            ResponseHeader::parse(&bad_size),
            Err(Error::ResponseSizeMismatch {
                declared: 0x20,
                actual: 10
            })
        ));

        let failed = [0x80, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x09, 0x22];
        let header = ResponseHeader::parse(&failed).unwrap();
        assert!(matches!(header.ensure_success(), Err(Error::Tpm(TpmRc::RETRY))));
    }

    const GET_RANDOM_1: [u8; 12] = [
        0x80, 0x01, 0x00, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x01, 0x7B, 0x00, 0x01,
    ];

    /// Serve one connection: answer the open-time GetRandom with `rc`,
    /// then run `session` on the connection
    fn serve<T: Send + 'static>(
        name: &str,
        rc: u32,
        session: impl FnOnce(&mut UnixStream) -> T + Send + 'static,
    ) -> (String, std::thread::JoinHandle<T>) {
        let dir = std::env::temp_dir().join(format!("tpm2-proto-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tpm.sock");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut cmd = [0u8; 12];
            conn.read_exact(&mut cmd).unwrap();
            assert_eq!(cmd, GET_RANDOM_1);
            let mut reply = vec![0x80, 0x01, 0x00, 0x00, 0x00, 0x0D];
            reply.extend(rc.to_be_bytes());
            reply.extend([0x00, 0x01, 0x5A]);
            if rc != 0 {
                reply.truncate(HEADER_SIZE);
                reply[5] = 0x0A;
            }
            conn.write_all(&reply).unwrap();
            session(&mut conn)
        });
        (format!("socket:{}", path.display()), server)
    }

    #[test]
    fn test_socket_transport() {
        let (spec, server) = serve("transport", 0, |conn| {
            let mut cmd = [0u8; 12];
            conn.read_exact(&mut cmd).unwrap();
            // Response split across two writes
            conn.write_all(&[0x80, 0x01, 0x00, 0x00, 0x00, 0x0E, 0])
                .unwrap();
            conn.flush().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
            conn.write_all(&[0, 0, 0, 0x00, 0x02, 0xAB, 0xCD]).unwrap();
            cmd
        });

        let mut tpm = TpmDevice::open(&spec).unwrap();
        let command = [
            0x80, 0x01, 0x00, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x01, 0x7B, 0x00, 0x02,
        ];
        let response = tpm.send(&command).unwrap();
        assert_eq!(response.len(), 14);
        assert_eq!(&response[10..], &[0x00, 0x02, 0xAB, 0xCD]);
        assert_eq!(server.join().unwrap(), command);
    }

    #[test]
    fn test_open_requires_answer() {
        let (spec, server) = serve("silent", TpmRc::INITIALIZE.0, |_| ());
        let err = TpmDevice::open(&spec).err().unwrap();
        server.join().unwrap();
        assert!(err.to_string().contains("did not answer"));
    }

    /// Hands out at most `step` bytes per read
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_response_in_pieces() {
        let data = vec![
            0x80, 0x01, 0x00, 0x00, 0x00, 0x0E, 0, 0, 0, 0, 0x00, 0x02, 0xAB, 0xCD,
        ];
        let mut reader = Trickle {
            data: data.clone(),
            pos: 0,
            step: 3,
        };
        assert_eq!(read_response(&mut reader).unwrap(), data);

        let mut short = Trickle {
            data: data[..12].to_vec(),
            pos: 0,
            step: 5,
        };
        let err = read_response(&mut short).unwrap_err();
        assert!(err.to_string().contains("closed after 12 response bytes"));
    }

    #[test]
    fn test_open_missing_device() {
        let err = TpmDevice::open("device:/nonexistent/tpm").err().unwrap();
        assert!(err.to_string().contains("failed to open TPM device"));
    }
}
