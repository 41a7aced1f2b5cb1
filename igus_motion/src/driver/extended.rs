//! Binary packet exchanges of extended mode.

use tracing::{debug, trace, warn};

use super::RobotInterface;
use crate::protocol::*;

impl RobotInterface {
    /// Writes `request` and reads one reply frame carrying `payload_len`
    /// payload bytes. Garbage in front of the reply is skipped by aligning
    /// the buffer to the request header. Returns `None` on a timeout, a
    /// broken port or a corrupt reply.
    pub(super) fn ext_command(&mut self, request: &Frame, payload_len: usize) -> Option<Frame> {
        let bytes = request.encode();
        let header = request.header();
        let reply_len = payload_len + FRAME_OVERHEAD;
        let wait = self.config.ext_wait();
        let attempts = self.config.ext_read_attempts;

        #[cfg(feature = "logging")]
        trace!("Extended cmd: {}", hex(&bytes));

        let link = self.link.as_mut()?;
        if link.write(&bytes) != 0 {
            warn!("Port {} disconnected.", self.port_number);
            self.close_link();
            if self.connected {
                self.disconnect_robot();
            }
            return None;
        }

        let mut buffer: Vec<u8> = Vec::with_capacity(reply_len);
        let mut chunk = vec![0u8; reply_len];
        let mut counter = 0;
        while buffer.len() < reply_len {
            counter += 1;
            if counter > attempts {
                trace!("Extended cmd {:?} timed out with {} bytes", request.command, buffer.len());
                return None;
            }

            let n = link.read(&mut chunk[..reply_len - buffer.len()], wait);
            if n == 0 {
                link.wait_event(wait);
                continue;
            }
            buffer.extend_from_slice(&chunk[..n]);

            if buffer.len() < 4 {
                continue;
            }
            align_to_header(&mut buffer, &header);
        }

        #[cfg(feature = "logging")]
        trace!("Extended reply: {}", hex(&buffer));

        match Frame::decode(&buffer) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!("Extended cmd {:?}: {}", request.command, e);
                None
            }
        }
    }

    /// Exchanges `request` and checks the reply is exactly `expected`.
    pub(super) fn ext_chat(&mut self, request: &Frame, expected: &Frame) -> bool {
        match self.ext_command(request, expected.payload.len()) {
            Some(reply) => reply == *expected,
            None => false,
        }
    }

    pub(super) fn ext_enable(&mut self) -> bool {
        self.ext_chat(&Frame::simple(Command::Init), &Frame::simple(Command::Init))
    }

    pub(super) fn ext_disable(&mut self) -> bool {
        self.ext_chat(&Frame::simple(Command::Exit), &Frame::simple(Command::Exit))
    }

    /// Sends the axis configuration together with the number of keyframes
    /// about to be transferred.
    pub(super) fn ext_send_config(&mut self, num_keyframes: usize) -> bool {
        let num_axes = match self.joints.check_axis_count() {
            Ok(n) => n,
            Err(e) => {
                warn!("{}", e);
                self.message("Number of joints is too big for microcontroller");
                return false;
            }
        };

        let mut config = ConfigPayload {
            num_keyframes: num_keyframes as u16,
            active_axes: num_axes as u16,
            lookahead: self.joints.lookahead,
            ..ConfigPayload::default()
        };
        for joint in self.joints.iter() {
            config.enc_to_mot[joint.address as usize - 1] = joint.enc_to_mot();
            debug!("enc_to_mot for {}: {}", joint.name, joint.enc_to_mot());
        }

        let sent = match Frame::with_payload(Command::Config, &config) {
            Ok(frame) => self.ext_chat(&frame, &Frame::simple(Command::Config)),
            Err(_) => false,
        };
        if !sent {
            self.message("Could not write configuration");
        }
        sent
    }
}

#[cfg(feature = "logging")]
fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}
