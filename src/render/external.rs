//! Renderer that delegates to an external program
//!
//! The program is given an argument list in which placeholders are
//! expanded per page:
//!
//! | placeholder   | value                                   |
//! |---------------|-----------------------------------------|
//! | `%file`       | path of the document                    |
//! | `%page`       | zero-based page index                   |
//! | `%resolution` | pixels per point                        |
//! | `%dpi`        | pixels per inch (`72 × resolution`)     |
//! | `%width`      | target width in pixels                  |
//! | `%height`     | target height in pixels                 |
//! | `%format`     | always `PNG`                            |
//!
//! The program must write a PNG image to standard output.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::frame::RasterImage;
use super::layout::DocumentLayout;
use super::renderer::PageRenderer;
use super::request::RenderError;
use super::types::PageIndex;

/// Longest time a single rendering process may run
pub const MAX_PROCESS_TIME: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

pub struct ExternalRenderer {
    command: String,
    /// Arguments with `%file` already substituted
    arguments: Vec<String>,
    layout: Arc<dyn DocumentLayout>,
    timeout: Duration,
}

impl ExternalRenderer {
    /// Create a renderer for the document at `file`.
    ///
    /// Fails unless a command is given and the arguments reference both
    /// `%file` and `%page`. Whether the command exists is only found out
    /// when rendering.
    pub fn new(
        command: impl Into<String>,
        arguments: &[String],
        file: &Path,
        layout: Arc<dyn DocumentLayout>,
    ) -> Result<Self, RenderError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(RenderError::InvalidRenderer(
                "no rendering command given".to_string(),
            ));
        }
        if !arguments.iter().any(|a| a.contains("%file")) {
            return Err(RenderError::InvalidRenderer(
                "rendering arguments must contain %file".to_string(),
            ));
        }
        if !arguments.iter().any(|a| a.contains("%page")) {
            return Err(RenderError::InvalidRenderer(
                "rendering arguments must contain %page".to_string(),
            ));
        }

        let file = file.to_string_lossy();
        let arguments = arguments
            .iter()
            .map(|a| a.replace("%file", &file))
            .collect();

        Ok(Self {
            command,
            arguments,
            layout,
            timeout: MAX_PROCESS_TIME,
        })
    }

    /// Override the process timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn expand_arguments(&self, page: PageIndex, resolution: f64) -> Vec<String> {
        let (width, height) = self
            .layout
            .page_size(page)
            .map(|size| {
                (
                    (size.width * resolution).round() as i64,
                    (size.height * resolution).round() as i64,
                )
            })
            .unwrap_or((0, 0));

        self.arguments
            .iter()
            .map(|arg| {
                arg.replace("%resolution", &resolution.to_string())
                    .replace("%dpi", &(resolution * 72.0).to_string())
                    .replace("%width", &width.to_string())
                    .replace("%height", &height.to_string())
                    .replace("%format", "PNG")
                    .replace("%page", &page.to_string())
            })
            .collect()
    }

    fn run(&self, page: PageIndex, resolution: f64) -> Result<Vec<u8>, RenderError> {
        if !(resolution > 0.0 && resolution.is_finite()) {
            return Err(RenderError::InvalidResolution(resolution));
        }
        let page_count = self.layout.page_count();
        if page >= page_count {
            return Err(RenderError::InvalidPage { page, page_count });
        }

        let args = self.expand_arguments(page, resolution);
        debug!("Running renderer: {} {:?}", self.command, args);

        let child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (status, stdout, stderr) = wait_with_timeout(child, self.timeout)?
            .ok_or(RenderError::Timeout {
                page,
                timeout: self.timeout,
            })?;

        if !status.success() {
            let message = String::from_utf8_lossy(&stderr);
            return Err(RenderError::engine(format!(
                "{} exited with {status}: {}",
                self.command,
                message.trim()
            )));
        }
        if !stdout.starts_with(PNG_SIGNATURE) {
            return Err(RenderError::engine(format!(
                "{} did not write a PNG image ({} bytes of output)",
                self.command,
                stdout.len()
            )));
        }
        Ok(stdout)
    }
}

impl PageRenderer for ExternalRenderer {
    fn render(&self, page: PageIndex, resolution: f64) -> Result<RasterImage, RenderError> {
        let data = self.run(page, resolution)?;
        let image = image::load_from_memory_with_format(&data, image::ImageFormat::Png)?;
        Ok(image.into_rgba8())
    }

    fn render_compressed(&self, page: PageIndex, resolution: f64) -> Result<Vec<u8>, RenderError> {
        self.run(page, resolution)
    }
}

/// Wait for `child`, collecting its output.
///
/// Returns `None` if it had to be killed after `timeout`. Output pipes are
/// drained on helper threads so a chatty child cannot block on a full pipe.
fn wait_with_timeout(
    mut child: Child,
    timeout: Duration,
) -> std::io::Result<Option<(ExitStatus, Vec<u8>, Vec<u8>)>> {
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            warn!("Rendering process timed out after {timeout:?}, killing it");
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    Ok(status.map(|status| (status, stdout, stderr)))
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}
