use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Closes a binary frame.
const BINARY_TERMINATOR: u8 = b'~';
/// Closes a text frame.
const TEXT_TERMINATOR: u8 = b'\n';

#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CommandError {
    #[error("empty command token")]
    EmptyToken,
    #[error("parameter {value} at index {index} does not fit a binary frame")]
    ParameterOutOfRange { index: usize, value: i16 },
}

/// Servo indices as numbered by the OpenCat firmware.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
pub enum JointId {
    HeadPan = 0,
    HeadTilt = 1,
    LeftFrontHip = 8,
    RightFrontHip = 9,
    FrontLeftKneePitch = 12,
    FrontRightKneePitch = 13,
    RearRightKneePitch = 14,
    RearLeftKneePitch = 15,
}

impl JointId {
    pub fn index(self) -> u8 {
        self as u8
    }
}

impl From<JointId> for i16 {
    fn from(joint: JointId) -> Self {
        joint.index() as i16
    }
}

/// A tokenized instruction for the board, plus the time the sender should
/// wait after writing it.
#[derive(Debug, PartialEq, Clone)]
pub struct Command {
    token: String,
    params: Vec<i16>,
    delay: Duration,
}

impl Command {
    pub fn new(token: impl Into<String>, params: Vec<i16>, delay: Duration) -> Command {
        Command {
            token: token.into(),
            params,
            delay,
        }
    }

    /// `g`, toggles the gyro.
    pub fn toggle_gyro(delay: Duration) -> Command {
        Command::new("g", vec![], delay)
    }

    /// `k<name>`, runs a skill stored in the firmware, e.g. `ksit`.
    pub fn skill(name: &str, delay: Duration) -> Command {
        Command::new(format!("k{}", name), vec![], delay)
    }

    /// `I`, moves every listed joint at the same time.
    pub fn indexed_move<T: Into<JointAngle>>(angles: Vec<T>, delay: Duration) -> Command {
        let mut params = Vec::with_capacity(angles.len() * 2);
        for angle in angles {
            let angle = angle.into();
            params.push(angle.joint.into());
            params.push(angle.angle);
        }
        Command::new("I", params, delay)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn params(&self) -> &[i16] {
        &self.params
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Binary frames are used for tokens starting with an uppercase letter.
    pub fn is_binary(&self) -> bool {
        self.token
            .chars()
            .next()
            .map(|c| c.is_ascii_uppercase())
            .unwrap_or(false)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CommandError> {
        if self.token.is_empty() {
            return Err(CommandError::EmptyToken);
        }
        let mut data = self.token.as_bytes().to_vec();
        if self.is_binary() {
            for (index, value) in self.params.iter().enumerate() {
                let byte = i8::try_from(*value).map_err(|_| CommandError::ParameterOutOfRange {
                    index,
                    value: *value,
                })?;
                data.push(byte as u8);
            }
            data.push(BINARY_TERMINATOR);
        } else {
            let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
            data.extend(params.join(" ").as_bytes());
            data.push(TEXT_TERMINATOR);
        }
        Ok(data)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "['{}', {:?}, {}]",
            self.token,
            self.params,
            self.delay.as_secs_f32()
        )
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct JointAngle {
    joint: JointId,
    angle: i16,
}

impl JointAngle {
    pub fn new(joint: JointId, angle: i16) -> JointAngle {
        JointAngle { joint, angle }
    }

    pub fn joint(&self) -> JointId {
        self.joint
    }

    pub fn angle(&self) -> i16 {
        self.angle
    }
}

impl From<(JointId, i16)> for JointAngle {
    fn from(input: (JointId, i16)) -> Self {
        let (joint, angle) = input;
        JointAngle::new(joint, angle)
    }
}
