//! Firmware update through an external flashing tool
//!
//! The session releases the serial port, then runs `stm32flash` against it as
//! a child process. Progress is read from the tool's merged stdout/stderr as
//! percentage tokens like `12.34`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use sonar_link::{LinkConfiguration, LinkType};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, trace, warn};

use crate::error::FirmwareError;
use crate::events::SessionEvent;

/// Percentage token printed by the flashing tool
pub const PROGRESS_PATTERN: &str = r"\d{1,3}\.\d\d";

/// Above this value the update counts as complete
pub const COMPLETE_THRESHOLD: f32 = 99.99;

/// A firmware image to flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRequest {
    pub image: PathBuf,
    pub baud: u32,
    /// Ask the tool to verify after writing
    pub verify: bool,
    /// Send the device to its bootloader before releasing the port
    pub goto_bootloader: bool,
}

impl FirmwareRequest {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            baud: 115_200,
            verify: true,
            goto_bootloader: true,
        }
    }
}

/// Flashing tool configuration
#[derive(Debug, Clone)]
pub struct FlasherConfig {
    pub tool_path: PathBuf,
    /// Wait after releasing the port, and again before rescanning
    pub settle_delay: Duration,
    /// Bound on waiting for pending writes before releasing the port
    pub drain_timeout: Duration,
    /// Bound on the whole tool run
    pub timeout: Duration,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            tool_path: default_tool_path(),
            settle_delay: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

/// `stm32flash` next to the running executable
///
/// On macOS the executable sits inside an app bundle, two levels below the
/// directory that holds the tool.
pub fn default_tool_path() -> PathBuf {
    let name = if cfg!(windows) {
        "stm32flash.exe"
    } else {
        "stm32flash"
    };
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    if cfg!(target_os = "macos") {
        exe_dir.join("..").join("..").join(name)
    } else {
        exe_dir.join(name)
    }
}

/// Picks the port handed to the flashing tool for the current link
pub type FlashTargetFn =
    Arc<dyn Fn(&LinkConfiguration) -> Result<String, FirmwareError> + Send + Sync>;

/// Only serial links can be flashed; the tool gets the device path
pub fn serial_flash_target(config: &LinkConfiguration) -> Result<String, FirmwareError> {
    if config.link_type() != LinkType::Serial {
        return Err(FirmwareError::NotSerial(config.link_type().name().to_string()));
    }
    Ok(config.serial_port().to_string())
}

/// Tool arguments: `-w <image> [-v] -g 0x0 -b <baud> <port>`
pub fn flash_arguments(image: &Path, baud: u32, verify: bool, port: &str) -> Vec<String> {
    let image = std::path::absolute(image).unwrap_or_else(|_| image.to_path_buf());
    let mut args = vec!["-w".to_string(), image.display().to_string()];
    if verify {
        args.push("-v".to_string());
    }
    args.extend([
        "-g".to_string(),
        "0x0".to_string(),
        "-b".to_string(),
        baud.to_string(),
        port.to_string(),
    ]);
    args
}

/// Longest tail kept between reads; a token is at most `100.00`
const CARRY_LIMIT: usize = 6;

/// Incremental parser for tool output
///
/// Pipe reads can split a token anywhere, so the unmatched tail of each chunk
/// is kept and scanned again in front of the next one.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    pattern: Regex,
    carry: String,
    last: Option<f32>,
    completed: bool,
}

impl ProgressParser {
    pub fn new() -> Result<Self, FirmwareError> {
        let pattern =
            Regex::new(PROGRESS_PATTERN).map_err(|e| FirmwareError::Pattern(e.to_string()))?;
        Ok(Self {
            pattern,
            carry: String::new(),
            last: None,
            completed: false,
        })
    }

    /// Scan one chunk of output, returning the percentages it completes
    pub fn feed(&mut self, chunk: &str) -> Vec<f32> {
        let mut text = std::mem::take(&mut self.carry);
        text.push_str(chunk);

        let mut values = Vec::new();
        let mut consumed = 0;
        for token in self.pattern.find_iter(&text) {
            consumed = token.end();
            let Ok(value) = token.as_str().parse::<f32>() else {
                continue;
            };
            self.last = Some(value);
            self.completed |= value > COMPLETE_THRESHOLD;
            values.push(value);
        }

        let tail = &text[consumed..];
        let mut start = tail.len().saturating_sub(CARRY_LIMIT);
        while !tail.is_char_boundary(start) {
            start += 1;
        }
        self.carry = tail[start..].to_string();
        values
    }

    /// Most recent progress value
    pub fn last(&self) -> Option<f32> {
        self.last
    }

    /// Progress has passed the completion threshold at least once
    pub fn is_complete(&self) -> bool {
        self.completed
    }
}

async fn read_some<R: AsyncRead + Unpin>(
    stream: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match stream {
        Some(stream) => stream.read(buf).await,
        None => Ok(0),
    }
}

/// Run the flashing tool to completion
///
/// Emits `FlashProgress` for every percentage seen. Succeeds only if the tool
/// exits cleanly after reporting completion; the child is killed if the
/// overall time limit runs out.
pub async fn run_flash_tool(
    program: &Path,
    args: &[String],
    limit: Duration,
    event_tx: &mpsc::Sender<SessionEvent>,
) -> Result<(), FirmwareError> {
    let mut parser = ProgressParser::new()?;
    match timeout(limit, drive_tool(program, args, &mut parser, event_tx)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Flashing tool timed out after {:?}", limit);
            Err(FirmwareError::Timeout(limit))
        }
    }
}

async fn drive_tool(
    program: &Path,
    args: &[String],
    parser: &mut ProgressParser,
    event_tx: &mpsc::Sender<SessionEvent>,
) -> Result<(), FirmwareError> {
    info!("Running {} {}", program.display(), args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FirmwareError::Spawn {
            tool: program.display().to_string(),
            reason: e.to_string(),
        })?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = [0u8; 512];
    let mut err_buf = [0u8; 512];

    while stdout.is_some() || stderr.is_some() {
        let chunk = tokio::select! {
            result = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => {
                match result {
                    Ok(0) => {
                        stdout = None;
                        continue;
                    }
                    Ok(n) => String::from_utf8_lossy(&out_buf[..n]).into_owned(),
                    Err(e) => return Err(FirmwareError::Io(e.to_string())),
                }
            }
            result = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => {
                match result {
                    Ok(0) => {
                        stderr = None;
                        continue;
                    }
                    Ok(n) => String::from_utf8_lossy(&err_buf[..n]).into_owned(),
                    Err(e) => return Err(FirmwareError::Io(e.to_string())),
                }
            }
        };

        trace!("flash: {}", chunk.trim_end());
        for value in parser.feed(&chunk) {
            let _ = event_tx.send(SessionEvent::FlashProgress(value)).await;
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| FirmwareError::Io(e.to_string()))?;

    if !status.success() {
        return Err(FirmwareError::ExitStatus(status.to_string()));
    }
    match parser.last() {
        None => Err(FirmwareError::NoProgress),
        Some(last) if !parser.is_complete() => Err(FirmwareError::Incomplete(last)),
        Some(_) => Ok(()),
    }
}
