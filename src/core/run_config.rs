use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Literal value of the `command` field of an arm message
pub const ARM_COMMAND: &str = "arm";

#[derive(Debug, Error, PartialEq)]
pub enum ArmCommandError {
    #[error("Malformed arm command: {0}")]
    Malformed(String),

    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("Field {field} must be non-negative, got {value}")]
    NegativeCount { field: &'static str, value: i64 },

    #[error("num_skip_frames must be at least 1: the first frame after arming is invalid")]
    NoSkipFrame,

    #[error("Invalid {field}: {value:?}")]
    InvalidName { field: &'static str, value: String },

    #[error("Frame counts add up to more than {max} frames")]
    TooManyFrames { max: u64 },
}

/// Run names arrive either as text or as a bare run number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunName {
    Number(u64),
    Text(String),
}

impl fmt::Display for RunName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunName::Number(n) => write!(f, "{}", n),
            RunName::Text(s) => f.write_str(s),
        }
    }
}

fn default_gain() -> i64 {
    4
}

fn default_binning() -> i64 {
    1
}

/// Arm message as it travels over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmCommand {
    pub command: String,
    pub experiment: String,
    pub run_name: RunName,
    pub num_skip_frames: i64,
    pub num_background_frames: i64,
    pub num_data_frames: i64,
    pub num_post_background_frames: i64,
    #[serde(default)]
    pub includes_shot_frame: bool,
    #[serde(default = "default_gain")]
    pub gain: i64,
    #[serde(default = "default_binning")]
    pub binning: i64,
    /// Overrides the derived run directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_files_path: Option<PathBuf>,
}

impl ArmCommand {
    pub fn parse(bytes: &[u8]) -> Result<Self, ArmCommandError> {
        serde_json::from_slice(bytes).map_err(|e| ArmCommandError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Plain data with string keys cannot fail to serialize
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Check the command and turn it into an immutable run configuration
    pub fn validate(&self) -> Result<RunConfig, ArmCommandError> {
        if self.command != ARM_COMMAND {
            return Err(ArmCommandError::UnknownCommand(self.command.clone()));
        }

        check_name("experiment", &self.experiment)?;
        let run_name = self.run_name.to_string();
        check_name("run_name", &run_name)?;

        let num_skip = non_negative("num_skip_frames", self.num_skip_frames)?;
        let num_background = non_negative("num_background_frames", self.num_background_frames)?;
        let num_data = non_negative("num_data_frames", self.num_data_frames)?;
        let num_post_background =
            non_negative("num_post_background_frames", self.num_post_background_frames)?;

        if num_skip == 0 {
            return Err(ArmCommandError::NoSkipFrame);
        }

        [num_background, num_data, num_post_background]
            .iter()
            .try_fold(num_skip, |total, &count| total.checked_add(count))
            .ok_or(ArmCommandError::TooManyFrames { max: u64::MAX })?;

        Ok(RunConfig {
            experiment: self.experiment.clone(),
            run_name,
            num_skip,
            num_background,
            num_data,
            num_post_background,
            includes_shot_frame: self.includes_shot_frame,
            gain: self.gain,
            binning: self.binning,
            save_files_path: self.save_files_path.clone(),
        })
    }
}

fn non_negative(field: &'static str, value: i64) -> Result<u64, ArmCommandError> {
    u64::try_from(value).map_err(|_| ArmCommandError::NegativeCount { field, value })
}

fn check_name(field: &'static str, value: &str) -> Result<(), ArmCommandError> {
    let bad = value.trim().is_empty()
        || value.contains('/')
        || value.contains('\\')
        || value == "."
        || value == "..";
    if bad {
        return Err(ArmCommandError::InvalidName {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Validated, immutable configuration of one acquisition run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub experiment: String,
    pub run_name: String,
    pub num_skip: u64,
    pub num_background: u64,
    pub num_data: u64,
    pub num_post_background: u64,
    pub includes_shot_frame: bool,
    pub gain: i64,
    pub binning: i64,
    pub save_files_path: Option<PathBuf>,
}

impl RunConfig {
    /// Total number of triggered frames the run expects
    pub fn expected_frames(&self) -> u64 {
        self.num_skip
            .saturating_add(self.num_background)
            .saturating_add(self.num_data)
            .saturating_add(self.num_post_background)
    }

    /// Directory the run writes into: `save_files_path` if given, else `<root>/<experiment>/<run_name>`
    pub fn run_directory(&self, root: &std::path::Path) -> PathBuf {
        match &self.save_files_path {
            Some(path) => path.clone(),
            None => root.join(&self.experiment).join(&self.run_name),
        }
    }
}
