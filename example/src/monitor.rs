// Live robot view. Keys: i=initialize s=stiff h=hardware compliant x=stop playback q=quit

use std::collections::VecDeque;
use std::error::Error;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use igus_motion::driver::{route, ComplianceMode, Producer, RobotEvent, RobotHandle, RobotState, RouteInput};
use igus_motion::player::JointAngles;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph};
use ratatui::{Frame, Terminal};
use tokio::sync::Mutex;

use crate::session::{next_event, Session};

const LOG_LINES: usize = 100;

struct LogEntry {
    timestamp: SystemTime,
    message: String,
}

#[derive(Default)]
struct AppState {
    connected: bool,
    initialized: bool,
    compliance: ComplianceMode,
    playing: bool,
    angles: JointAngles,
    velocities: JointAngles,
    log: VecDeque<LogEntry>,
    should_quit: bool,
}

impl AppState {
    fn add_log(&mut self, message: String) {
        self.log.push_back(LogEntry { timestamp: SystemTime::now(), message });
        if self.log.len() > LOG_LINES {
            self.log.pop_front();
        }
    }

    fn robot_state(&self) -> RobotState {
        match self.compliance {
            _ if !self.initialized => RobotState::Off,
            ComplianceMode::Stiff => RobotState::Stiff,
            ComplianceMode::Hardware => RobotState::HardwareCompliant,
            ComplianceMode::Software => RobotState::SoftwareCompliant,
        }
    }

    fn apply(&mut self, event: RobotEvent) {
        match event {
            RobotEvent::Connected => self.add_log("Robot connected".to_string()),
            RobotEvent::Disconnected => {
                self.initialized = false;
                self.playing = false;
                self.add_log("Robot disconnected".to_string());
            }
            RobotEvent::ConnectionChanged(connected) => self.connected = connected,
            RobotEvent::Initialized => self.initialized = true,
            RobotEvent::Message(message) => self.add_log(message),
            RobotEvent::MotionOut { angles, velocities } => {
                self.angles = angles;
                self.velocities = velocities;
            }
            RobotEvent::PlaybackStarted => self.playing = true,
            RobotEvent::PlaybackFinished => self.playing = false,
            RobotEvent::ComplianceChanged(mode) => self.compliance = mode,
            RobotEvent::KeyframeTransferFinished(ok) => {
                self.add_log(format!("Keyframe transfer {}", if ok { "finished" } else { "failed" }))
            }
        }
    }
}

pub async fn run(session: Session) -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let app_state = Arc::new(Mutex::new(AppState::default()));

    let mut events = session.handle.subscribe();
    let app_state_clone = Arc::clone(&app_state);
    let listener = tokio::spawn(async move {
        while let Some(event) = next_event(&mut events).await {
            app_state_clone.lock().await.apply(event);
        }
    });

    let res = run_app(&mut terminal, &session.handle, app_state).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    listener.abort();
    session.close().await;
    res
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    handle: &RobotHandle,
    app_state: Arc<Mutex<AppState>>,
) -> Result<(), Box<dyn Error>> {
    loop {
        {
            let state = app_state.lock().await;
            terminal.draw(|f| ui(f, &state))?;
            if state.should_quit {
                break;
            }
        }

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                let mut state = app_state.lock().await;
                handle_key(key.code, handle, &mut state);
            }
        }
    }
    Ok(())
}

fn handle_key(key: KeyCode, handle: &RobotHandle, state: &mut AppState) {
    match key {
        KeyCode::Char('q') | KeyCode::Esc => state.should_quit = true,
        KeyCode::Char('i') => handle.initialize(),
        KeyCode::Char('s') => handle.set_compliance_mode(ComplianceMode::Stiff),
        KeyCode::Char('h') => handle.set_compliance_mode(ComplianceMode::Hardware),
        KeyCode::Char('x') if state.playing => {
            handle.stop_playing();
            state.add_log("Stop requested".to_string());
        }
        _ => {}
    }
}

fn ui(f: &mut Frame, state: &AppState) {
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(6), Constraint::Min(8), Constraint::Length(3)])
        .split(f.area());

    render_status(f, main_chunks[0], state);

    let data_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(main_chunks[1]);
    render_joints(f, data_chunks[0], state);
    render_log(f, data_chunks[1], state);

    let help = Paragraph::new(Line::from("  i=Initialize  s=Stiff  h=Hardware compliant  x=Stop playback  q=Quit"))
        .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, main_chunks[2]);
}

fn flag(label: &str, on: bool) -> Vec<Span<'static>> {
    vec![
        Span::styled(format!("{}: ", label), Style::default().fg(Color::Cyan)),
        Span::styled(
            if on { "yes  " } else { "no   " },
            Style::default().fg(if on { Color::Green } else { Color::Red }),
        ),
    ]
}

fn render_status(f: &mut Frame, area: Rect, state: &AppState) {
    let routing = route(RouteInput { state: state.robot_state(), player_playing: false, robot_playing: state.playing });
    let driver = match routing.robot {
        Producer::Autonomous => "controller sequence",
        Producer::Editor => "host",
        Producer::Player => "host player",
        Producer::None => "nobody",
    };

    let mut first = flag("Connected", state.connected);
    first.extend(flag("Initialized", state.initialized));
    first.extend(flag("Playing", state.playing));
    let lines = vec![
        Line::from(first),
        Line::from(vec![
            Span::styled("Compliance: ", Style::default().fg(Color::Cyan)),
            Span::raw(format!("{:?}", state.compliance)),
        ]),
        Line::from(vec![
            Span::styled("Arm driven by: ", Style::default().fg(Color::Cyan)),
            Span::styled(driver, Style::default().fg(Color::Magenta)),
        ]),
    ];
    let block = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Robot"));
    f.render_widget(block, area);
}

fn render_joints(f: &mut Frame, area: Rect, state: &AppState) {
    let mut lines = vec![Line::from(Span::styled(
        format!("{:<12} {:>9} {:>9}", "Joint", "rad", "rad/s"),
        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
    ))];
    if state.angles.is_empty() {
        lines.push(Line::from("  No data"));
    }
    for (name, angle) in &state.angles {
        let velocity = state.velocities.get(name).copied().unwrap_or(0.0);
        lines.push(Line::from(format!("{:<12} {:>+9.4} {:>+9.4}", name, angle, velocity)));
    }
    let paragraph = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Joints")
            .border_style(Style::default().fg(Color::Yellow)),
    );
    f.render_widget(paragraph, area);
}

fn render_log(f: &mut Frame, area: Rect, state: &AppState) {
    let items: Vec<ListItem> = state
        .log
        .iter()
        .rev()
        .map(|entry| {
            let elapsed = entry.timestamp.elapsed().unwrap_or(Duration::ZERO);
            ListItem::new(Line::from(vec![
                Span::styled(format!("[{}s] ", elapsed.as_secs()), Style::default().fg(Color::DarkGray)),
                Span::raw(entry.message.as_str()),
            ]))
        })
        .collect();
    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Messages")
            .border_style(Style::default().fg(Color::Green)),
    );
    f.render_widget(list, area);
}
