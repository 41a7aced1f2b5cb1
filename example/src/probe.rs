use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

use igus_motion::protocol::{Command, Frame, FrameParser, ResetPayload, VERSION};
use igus_motion::transport::{Link, SerialLink};
use tracing::{debug, info};

/// Wait for the `Init` acknowledgement of one candidate version.
const PROBE_WAIT: Duration = Duration::from_millis(200);

fn init_frame(version: u8) -> Frame {
    Frame { version, ..Frame::simple(Command::Init) }
}

/// True when an `Init` acknowledgement of `version` arrives within `wait`.
fn acknowledges(link: &mut dyn Link, version: u8, wait: Duration) -> bool {
    if link.write(&init_frame(version).encode()) != 0 {
        return false;
    }
    let deadline = Instant::now() + wait;
    let mut parser = FrameParser::with_version(version);
    let mut buf = [0u8; 64];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let n = link.read(&mut buf, deadline - now);
        if parser.feed(&buf[..n]).iter().any(|frame| frame.command == Command::Init) {
            return true;
        }
        if n == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Tries every version from 0 up to ten past the current one and returns
/// the first one the controller answers.
pub fn find_version(link: &mut dyn Link, wait: Duration) -> Option<u8> {
    (0..=VERSION + 10).find(|&version| {
        debug!("Probing protocol version {}", version);
        acknowledges(link, version, wait)
    })
}

/// Keyed reset that sends the controller into its bootloader.
pub fn reset_frame(version: u8) -> Result<Frame, igus_motion::MotionError> {
    let frame = Frame::with_payload(Command::Reset, &ResetPayload::default())?;
    Ok(Frame { version, ..frame })
}

pub fn probe_reset(port: &str, baud_rate: u32) -> Result<(), Box<dyn Error>> {
    let mut link = SerialLink::open(port, baud_rate)?;
    let version = find_version(&mut link, PROBE_WAIT).ok_or("No controller answered on any protocol version")?;
    info!("Controller on {} speaks protocol version {}", link.name(), version);
    if link.write(&reset_frame(version)?.encode()) != 0 {
        return Err("Could not send the reset packet".into());
    }
    info!("Reset sent, the controller is in its bootloader");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use igus_motion::transport::MockLink;

    /// Acknowledges `Init` frames of one version only.
    fn controller(version: u8) -> MockLink {
        MockLink::with_responder(move |bytes| {
            let mut parser = FrameParser::with_version(version);
            match parser.feed(bytes).first() {
                Some(frame) if frame.command == Command::Init => init_frame(version).encode(),
                _ => Vec::new(),
            }
        })
    }

    #[test]
    fn finds_an_older_firmware_version() {
        let mut link = controller(7);
        assert_eq!(find_version(&mut link, Duration::from_millis(5)), Some(7));
        let written = link.take_written();
        // versions 0 to 7, one six byte Init each
        assert_eq!(written.len(), 8 * 6);
        assert_eq!(&written[written.len() - 6..], &[0xFF, 7, 0, 0, !7u8, 0x0D]);
    }

    #[test]
    fn silent_port_yields_nothing() {
        let mut link = MockLink::new();
        assert_eq!(find_version(&mut link, Duration::from_millis(1)), None);
        assert_eq!(link.take_written().len(), (VERSION as usize + 11) * 6);
    }

    #[test]
    fn reset_carries_key_and_version() {
        let frame = match reset_frame(3) {
            Ok(frame) => frame,
            Err(e) => panic!("Reset frame failed: {:?}", e),
        };
        let bytes = frame.encode();
        assert_eq!(&bytes[..4], &[0xFF, 3, 1, 8]);
        assert_eq!(&bytes[4..12], &ResetPayload::default().key);
        assert_eq!(bytes.len(), 14);
    }
}
