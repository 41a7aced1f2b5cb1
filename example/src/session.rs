use std::error::Error;
use std::thread;
use std::time::Duration;

use igus_motion::driver::{ComplianceMode, RobotEvent, RobotHandle, RobotInterface, RobotInterfaceConfig};
use igus_motion::transport::SerialPortOpener;
use igus_motion::{JointTable, MotionError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::Connection;

/// Time the robot gets to show up, including a full initialization.
const READY_TIMEOUT: Duration = Duration::from_secs(120);
const COMPLIANCE_TIMEOUT: Duration = Duration::from_secs(10);

/// A robot interface running on its own thread, plus an event subscription.
pub struct Session {
    pub handle: RobotHandle,
    pub events: broadcast::Receiver<RobotEvent>,
    thread: thread::JoinHandle<()>,
}

impl Session {
    pub fn open(connection: &Connection) -> Result<Self, Box<dyn Error>> {
        let joints = JointTable::load(&connection.joints)?;
        let ports: Vec<String> = connection.port.iter().cloned().collect();
        let config = RobotInterfaceConfig::new(ports.clone(), connection.baud);
        config.validate()?;

        let (events, receiver) = broadcast::channel(256);
        let opener = SerialPortOpener::new(ports, connection.baud);
        let interface = RobotInterface::new(config, joints, Box::new(opener), events);
        let (handle, thread) = interface.spawn();
        handle.set_speed_limit(connection.speed);
        Ok(Self { handle, events: receiver, thread })
    }

    /// Next event, skipping over a lagged subscription.
    pub async fn next_event(&mut self) -> Option<RobotEvent> {
        next_event(&mut self.events).await
    }

    async fn next_event_before(&mut self, deadline: Instant, what: &str) -> Result<RobotEvent, MotionError> {
        match timeout_at(deadline, self.next_event()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(MotionError::Disconnected()),
            Err(_) => Err(MotionError::HandshakeTimeout(what.to_string())),
        }
    }

    /// Waits until the robot is initialized and streaming in extended mode.
    /// Initializes it when the connection check finds it uninitialized.
    pub async fn ready(&mut self) -> Result<(), MotionError> {
        let deadline = Instant::now() + READY_TIMEOUT;
        let mut initialized = false;
        let mut requested = false;
        info!("Waiting for the robot");
        loop {
            match self.next_event_before(deadline, "robot did not become ready").await? {
                RobotEvent::Connected => info!("Robot connected"),
                RobotEvent::Disconnected => {
                    warn!("Robot disconnected, waiting for it to come back");
                    initialized = false;
                    requested = false;
                }
                RobotEvent::Initialized => initialized = true,
                RobotEvent::MotionOut { .. } if initialized => return Ok(()),
                RobotEvent::MotionOut { .. } => {
                    if !requested {
                        self.handle.initialize();
                        requested = true;
                    }
                }
                other => debug!("{:?}", other),
            }
        }
    }

    pub async fn change_compliance(&mut self, mode: ComplianceMode) -> Result<(), MotionError> {
        self.ready().await?;
        self.handle.set_compliance_mode(mode);
        let deadline = Instant::now() + COMPLIANCE_TIMEOUT;
        loop {
            match self.next_event_before(deadline, "compliance change").await? {
                RobotEvent::ComplianceChanged(changed) if changed == mode => return Ok(()),
                RobotEvent::ComplianceChanged(changed) => {
                    return Err(MotionError::HandshakeTimeout(format!("robot stayed {:?}", changed)))
                }
                RobotEvent::Disconnected => return Err(MotionError::Disconnected()),
                _ => {}
            }
        }
    }

    /// Leaves extended mode, closes the port and joins the interface thread.
    pub async fn close(self) {
        self.handle.shutdown();
        let thread = self.thread;
        if !matches!(tokio::task::spawn_blocking(move || thread.join()).await, Ok(Ok(()))) {
            warn!("Robot interface thread did not stop cleanly");
        }
    }
}

pub async fn next_event(events: &mut broadcast::Receiver<RobotEvent>) -> Option<RobotEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => debug!("Skipped {} robot events", skipped),
            Err(RecvError::Closed) => return None,
        }
    }
}
