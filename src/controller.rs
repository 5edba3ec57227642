use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::instructions::{Command, JointId};
use crate::serial_driver::DEFAULT_BAUD_RATE;
use crate::{connect_ports, ConnectedPorts};

pub const QUIT_PROMPT: &str = "Press Enter to continue or 'q' + Enter to quit: ";

const WARM_UP: Duration = Duration::from_secs(3);
const SEND_DELAY: Duration = Duration::from_secs(1);
const SERVO_DELAY: Duration = Duration::from_millis(500);
const POSE_DELAY: Duration = Duration::from_secs(1);

/// Offset subtracted from the step counter to get the hip angle.
const SWING_OFFSET: i16 = 50;
const SWING_STEPS: i16 = 19;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Ports to open. Empty means discover them.
    pub ports: Vec<String>,
    pub baud_rate: u32,
    /// Time the board needs after the port opens before it accepts commands.
    pub warm_up: Duration,
    pub send_delay: Duration,
    pub servo_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            ports: vec![],
            baud_rate: DEFAULT_BAUD_RATE,
            warm_up: WARM_UP,
            send_delay: SEND_DELAY,
            servo_delay: SERVO_DELAY,
        }
    }
}

/// Shared stop request between the command loop and the input thread.
#[derive(Debug, Clone, Default)]
pub struct QuitFlag(Arc<AtomicBool>);

impl QuitFlag {
    pub fn new() -> QuitFlag {
        QuitFlag::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Prompts for a line until `q` is entered, then raises the flag.
/// Returns without raising it if the input ends or fails first. Lines that
/// are not valid UTF-8 are skipped.
pub fn await_quit_keystroke<R: BufRead, W: Write>(flag: &QuitFlag, mut input: R, mut prompt: W) {
    let mut line = String::new();
    while !flag.is_set() {
        let _ = write!(prompt, "{}", QUIT_PROMPT);
        let _ = prompt.flush();
        line.clear();
        match input.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                warn!(%error, "ignoring unreadable input line");
                continue;
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                error!(%error, "stopped reading quit requests");
                return;
            }
        }
        if line.trim_end_matches(['\r', '\n']) == "q" {
            flag.request();
            info!("Received 'q' command. Exiting soon...");
        }
    }
}

/// Runs [`await_quit_keystroke`] on its own thread. The handle may be
/// dropped; the thread then lives until the process exits.
pub fn spawn_quit_listener<R>(flag: QuitFlag, input: R) -> JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    thread::spawn(move || await_quit_keystroke(&flag, input, io::stdout()))
}

/// Hip angles for one full swing: up from -49 to -31, then back down to -50.
pub fn swing_angles() -> impl Iterator<Item = i16> {
    let rising = 1..=SWING_STEPS;
    let falling = (0..SWING_STEPS).rev();
    rising.chain(falling).map(|i| i - SWING_OFFSET)
}

fn swing_command(angle: i16, delay: Duration) -> Command {
    Command::indexed_move(
        vec![(JointId::LeftFrontHip, angle), (JointId::RightFrontHip, angle)],
        delay,
    )
}

/// The commands sent once the board is ready: gyro toggle, sit, then fold the knees.
pub fn initial_pose() -> Vec<Command> {
    vec![
        Command::toggle_gyro(POSE_DELAY),
        Command::skill("sit", POSE_DELAY),
        Command::indexed_move(
            vec![
                (JointId::FrontLeftKneePitch, 90),
                (JointId::FrontRightKneePitch, 90),
                (JointId::RearRightKneePitch, -40),
                (JointId::RearLeftKneePitch, -40),
            ],
            POSE_DELAY,
        ),
    ]
}

pub struct Controller {
    ports: ConnectedPorts,
    config: ControllerConfig,
    quit: QuitFlag,
}

impl Controller {
    /// Opens the configured (or discovered) ports and brings the board into
    /// its starting pose.
    pub async fn connect(config: ControllerConfig) -> Result<Controller> {
        let ports = connect_ports(&config.ports, config.baud_rate)?;
        Controller::with_ports(ports, config).await
    }

    pub async fn with_ports(ports: ConnectedPorts, config: ControllerConfig) -> Result<Controller> {
        let mut controller = Controller {
            ports,
            config,
            quit: QuitFlag::new(),
        };
        controller.initialize().await?;
        Ok(controller)
    }

    async fn initialize(&mut self) -> Result<()> {
        if self.ports.len() > 1 {
            self.ports.keep_first();
        }
        if self.ports.is_empty() {
            return Ok(());
        }
        info!(ports = ?self.ports.names(), "connected");
        tokio::time::sleep(self.config.warm_up).await;
        for command in initial_pose() {
            self.send_command(&command).await?;
        }
        Ok(())
    }

    pub fn quit_flag(&self) -> QuitFlag {
        self.quit.clone()
    }

    pub fn is_connected(&self) -> bool {
        !self.ports.is_empty()
    }

    /// Sends without waiting for an acknowledgement, then pauses for the send delay.
    pub async fn send_command(&mut self, command: &Command) -> Result<()> {
        self.ports.send(command).await?;
        tokio::time::sleep(self.config.send_delay).await;
        Ok(())
    }

    /// Swings both front hips back and forth until quit is requested. The
    /// flag is checked before every step.
    pub async fn run_command_loop(&mut self) -> Result<()> {
        while !self.quit.is_set() {
            for angle in swing_angles() {
                if self.quit.is_set() {
                    break;
                }
                let command = swing_command(angle, self.config.servo_delay);
                info!(%command);
                self.send_command(&command).await?;
            }
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        self.ports.close_all().await;
        info!("Finished!");
    }

    /// Runs the swing loop with quit requests read from stdin.
    pub async fn run(&mut self) -> Result<()> {
        self.run_with_input(io::BufReader::new(io::stdin())).await
    }

    pub async fn run_with_input<R>(&mut self, input: R) -> Result<()>
    where
        R: BufRead + Send + 'static,
    {
        if !self.is_connected() {
            error!("No ports connected. Exiting.");
            return Ok(());
        }
        spawn_quit_listener(self.quit.clone(), input);

        match self.run_command_loop().await {
            Ok(()) => {
                self.shutdown().await;
                Ok(())
            }
            Err(error) => {
                error!("Exception: {}", error);
                self.shutdown().await;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{drain, mock_driver, Event, MockSerialPort};
    use std::io::Cursor;
    use std::sync::mpsc::channel;

    fn sent_commands(events: &[Event]) -> Vec<Command> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::Sent(command) => Some(command.clone()),
                Event::Closed => None,
            })
            .collect()
    }

    fn closes(events: &[Event]) -> usize {
        events.iter().filter(|e| **e == Event::Closed).count()
    }

    fn hip_angles(commands: &[Command]) -> Vec<i16> {
        commands
            .iter()
            .map(|command| {
                let params = command.params();
                assert_eq!(command.token(), "I");
                assert_eq!(params[0], 8);
                assert_eq!(params[2], 9);
                assert_eq!(params[1], params[3]);
                params[1]
            })
            .collect()
    }

    #[test]
    fn initial_pose_sequence() {
        let pose = initial_pose();
        assert_eq!(pose.len(), 3);
        assert_eq!(pose[0].token(), "g");
        assert!(pose[0].params().is_empty());
        assert_eq!(pose[1].token(), "ksit");
        assert!(pose[1].params().is_empty());
        assert_eq!(pose[2].token(), "I");
        assert_eq!(pose[2].params(), &[12, 90, 13, 90, 14, -40, 15, -40]);
        assert!(pose.iter().all(|c| c.delay() == Duration::from_secs(1)));
    }

    #[test]
    fn swing_angles_rise_then_fall() {
        let angles: Vec<i16> = swing_angles().collect();
        let mut expected: Vec<i16> = (1..20).map(|i| i - 50).collect();
        expected.extend((0..19).rev().map(|i| i - 50));
        assert_eq!(angles, expected);
        assert_eq!(angles.first(), Some(&-49));
        assert_eq!(angles[18], -31);
        assert_eq!(angles.last(), Some(&-50));
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_sends_pose_to_first_port_only() {
        let (tx, rx) = channel();
        let (other_tx, other_rx) = channel();
        let mut ports = ConnectedPorts::new();
        ports.insert("/dev/ttyUSB0", mock_driver(MockSerialPort::new(vec![], tx)));
        ports.insert("/dev/ttyUSB1", mock_driver(MockSerialPort::new(vec![], other_tx)));

        let start = tokio::time::Instant::now();
        let controller = Controller::with_ports(ports, ControllerConfig::default())
            .await
            .unwrap();
        assert!(controller.is_connected());
        // warm-up, then transport delay and send delay for each pose command
        assert!(start.elapsed() >= Duration::from_secs(3 + 3 * 2));

        let events = drain(&rx);
        assert_eq!(sent_commands(&events), initial_pose());
        assert!(drain(&other_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn no_ports_sends_nothing() {
        let mut controller = Controller::with_ports(ConnectedPorts::new(), ControllerConfig::default())
            .await
            .unwrap();
        assert!(!controller.is_connected());
        controller
            .run_with_input(Cursor::new(Vec::new()))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_before_next_step_once_quit_is_requested() {
        let (tx, rx) = channel();
        let flag = QuitFlag::new();
        // three pose commands, then five swing steps
        let port = MockSerialPort::new(vec![], tx).quit_after(3 + 5, flag.clone());
        let mut ports = ConnectedPorts::new();
        ports.insert("/dev/ttyACM0", mock_driver(port));
        let mut controller = Controller::with_ports(ports, ControllerConfig::default())
            .await
            .unwrap();
        controller.quit = flag;

        controller.run_command_loop().await.unwrap();
        let commands = sent_commands(&drain(&rx));
        assert_eq!(hip_angles(&commands[3..]), vec![-49, -48, -47, -46, -45]);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_in_falling_stage() {
        let (tx, rx) = channel();
        let flag = QuitFlag::new();
        let port = MockSerialPort::new(vec![], tx).quit_after(3 + 19 + 2, flag.clone());
        let mut ports = ConnectedPorts::new();
        ports.insert("/dev/ttyACM0", mock_driver(port));
        let mut controller = Controller::with_ports(ports, ControllerConfig::default())
            .await
            .unwrap();
        controller.quit = flag;

        controller.run_command_loop().await.unwrap();
        let angles = hip_angles(&sent_commands(&drain(&rx))[3..]);
        assert_eq!(angles.len(), 21);
        assert_eq!(&angles[19..], &[-32, -33]);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_repeats_full_swing() {
        let (tx, rx) = channel();
        let flag = QuitFlag::new();
        let port = MockSerialPort::new(vec![], tx).quit_after(3 + 38 + 1, flag.clone());
        let mut ports = ConnectedPorts::new();
        ports.insert("/dev/ttyACM0", mock_driver(port));
        let mut controller = Controller::with_ports(ports, ControllerConfig::default())
            .await
            .unwrap();
        controller.quit = flag;

        controller.run_command_loop().await.unwrap();
        let angles = hip_angles(&sent_commands(&drain(&rx))[3..]);
        assert_eq!(angles.len(), 39);
        assert_eq!(angles[37], -50);
        assert_eq!(angles[38], -49);
    }

    #[tokio::test(start_paused = true)]
    async fn error_mid_loop_closes_port_once() {
        let (tx, rx) = channel();
        let port = MockSerialPort::new(vec![], tx).fail_after(3 + 4);
        let mut ports = ConnectedPorts::new();
        ports.insert("/dev/ttyUSB0", mock_driver(port));
        let mut controller = Controller::with_ports(ports, ControllerConfig::default())
            .await
            .unwrap();

        let result = controller.run_with_input(Cursor::new(Vec::new())).await;
        assert_eq!(result.unwrap_err().to_string(), "mock port unplugged");
        assert!(!controller.is_connected());

        controller.shutdown().await;
        let events = drain(&rx);
        assert_eq!(closes(&events), 1);
        assert_eq!(sent_commands(&events).len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_ends_run_and_closes_port() {
        let (tx, rx) = channel();
        let flag = QuitFlag::new();
        let port = MockSerialPort::new(vec![], tx).quit_after(3 + 1, flag.clone());
        let mut ports = ConnectedPorts::new();
        ports.insert("/dev/ttyUSB0", mock_driver(port));
        let mut controller = Controller::with_ports(ports, ControllerConfig::default())
            .await
            .unwrap();
        controller.quit = flag;

        controller
            .run_with_input(Cursor::new(Vec::new()))
            .await
            .unwrap();
        let events = drain(&rx);
        assert_eq!(sent_commands(&events).len(), 4);
        assert_eq!(events.last(), Some(&Event::Closed));
        assert_eq!(closes(&events), 1);
    }

    #[test]
    fn keystroke_q_sets_flag() {
        let flag = QuitFlag::new();
        let mut prompt = Vec::new();
        await_quit_keystroke(&flag, Cursor::new(b"\nhello\nq\nnever read\n".to_vec()), &mut prompt);
        assert!(flag.is_set());
        assert_eq!(String::from_utf8(prompt).unwrap(), QUIT_PROMPT.repeat(3));
    }

    #[test]
    fn keystroke_requires_exact_q() {
        let flag = QuitFlag::new();
        let mut prompt = Vec::new();
        await_quit_keystroke(&flag, Cursor::new(b" q\nQ\nquit\n".to_vec()), &mut prompt);
        assert!(!flag.is_set());
    }

    #[test]
    fn keystroke_skips_non_utf8_line() {
        let flag = QuitFlag::new();
        let mut prompt = Vec::new();
        await_quit_keystroke(&flag, Cursor::new(b"\xff\nq\n".to_vec()), &mut prompt);
        assert!(flag.is_set());
        assert_eq!(String::from_utf8(prompt).unwrap(), QUIT_PROMPT.repeat(2));
    }

    struct BrokenInput;

    impl io::Read for BrokenInput {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "terminal gone"))
        }
    }

    #[test]
    fn keystroke_stops_on_read_failure() {
        let flag = QuitFlag::new();
        await_quit_keystroke(&flag, io::BufReader::new(BrokenInput), io::sink());
        assert!(!flag.is_set());
    }

    #[tokio::test]
    async fn unopenable_port_is_skipped() {
        let ports = connect_ports(&["/dev/does-not-exist".to_string()], DEFAULT_BAUD_RATE).unwrap();
        assert!(ports.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_without_ports_runs_to_ok() {
        let config = ControllerConfig {
            ports: vec!["/dev/does-not-exist".to_string()],
            ..ControllerConfig::default()
        };
        let mut controller = Controller::connect(config).await.unwrap();
        assert!(!controller.is_connected());
        controller
            .run_with_input(Cursor::new(Vec::new()))
            .await
            .unwrap();
    }

    #[test]
    fn keystroke_accepts_crlf() {
        let flag = QuitFlag::new();
        await_quit_keystroke(&flag, Cursor::new(b"q\r\n".to_vec()), io::sink());
        assert!(flag.is_set());
    }

    #[test]
    fn listener_thread_sets_shared_flag() {
        let flag = QuitFlag::new();
        let handle = spawn_quit_listener(flag.clone(), Cursor::new(b"q\n".to_vec()));
        handle.join().unwrap();
        assert!(flag.is_set());
    }
}
