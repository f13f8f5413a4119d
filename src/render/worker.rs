//! Render worker - one background thread per renderer instance

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use flume::{Receiver, Sender};
use log::{debug, warn};

use super::frame::CompressedFrame;
use super::renderer::PageRenderer;
use super::request::{RenderError, WorkerJob, WorkerReport};
use super::types::PageIndex;

/// Handle to a render thread.
///
/// The thread owns its renderer for its whole life. The handle tracks
/// whether a job is outstanding; it turns idle again when the manager
/// processes the matching report.
pub struct RenderWorker {
    id: usize,
    jobs: Sender<WorkerJob>,
    handle: Option<JoinHandle<()>>,
    assigned: Option<PageIndex>,
}

impl RenderWorker {
    /// Start a worker thread around `renderer`
    pub fn spawn<R: PageRenderer + 'static>(
        id: usize,
        renderer: R,
        reports: Sender<WorkerReport>,
    ) -> std::io::Result<Self> {
        let (jobs, job_rx) = flume::unbounded();
        let handle = thread::Builder::new()
            .name(format!("render-worker-{id}"))
            .spawn(move || render_worker(id, &renderer, job_rx, reports))?;

        Ok(Self {
            id,
            jobs,
            handle: Some(handle),
            assigned: None,
        })
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.assigned.is_none()
    }

    /// Page the worker is rendering right now
    #[must_use]
    pub fn assigned(&self) -> Option<PageIndex> {
        self.assigned
    }

    /// Start rendering `page`. Does nothing unless the worker is idle.
    ///
    /// Returns true if the job was handed to the thread.
    pub fn assign(&mut self, page: PageIndex, resolution: f64) -> bool {
        if !self.is_idle() {
            return false;
        }
        match self.jobs.send(WorkerJob::Render { page, resolution }) {
            Ok(()) => {
                self.assigned = Some(page);
                true
            }
            Err(_) => {
                warn!("Render worker {} is gone, cannot render page {page}", self.id);
                false
            }
        }
    }

    /// Mark the outstanding job as delivered
    pub(crate) fn finish(&mut self) -> Option<PageIndex> {
        self.assigned.take()
    }

    /// False once the thread has exited
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the thread to stop after its current job
    pub(crate) fn request_shutdown(&self) {
        let _ = self.jobs.send(WorkerJob::Shutdown);
    }

    /// Join the thread if it has exited. Returns true once no thread is left.
    pub(crate) fn join_if_finished(&mut self) -> bool {
        match self.handle.take() {
            None => true,
            Some(handle) if handle.is_finished() => {
                if handle.join().is_err() {
                    warn!("Render worker {} panicked", self.id);
                }
                true
            }
            Some(handle) => {
                self.handle = Some(handle);
                false
            }
        }
    }

    /// Give up on the thread without joining it
    pub(crate) fn detach(&mut self) {
        self.handle.take();
    }
}

/// Main worker function - runs in a dedicated thread
fn render_worker<R: PageRenderer>(
    id: usize,
    renderer: &R,
    jobs: Receiver<WorkerJob>,
    reports: Sender<WorkerReport>,
) {
    for job in jobs {
        match job {
            WorkerJob::Render { page, resolution } => {
                let started = Instant::now();
                let outcome = render_job(renderer, page, resolution);
                debug!(
                    "Worker {id} rendered page {page} at {resolution:.4} in {:?} (ok: {})",
                    started.elapsed(),
                    outcome.is_ok()
                );
                let report = WorkerReport {
                    worker: id,
                    page,
                    resolution,
                    outcome,
                };
                if reports.send(report).is_err() {
                    // manager dropped its receiver
                    break;
                }
            }

            WorkerJob::Shutdown => break,
        }
    }
}

fn render_job<R: PageRenderer>(
    renderer: &R,
    page: PageIndex,
    resolution: f64,
) -> Result<CompressedFrame, RenderError> {
    let data = catch_unwind(AssertUnwindSafe(|| {
        renderer.render_compressed(page, resolution)
    }))
    .map_err(|_| RenderError::Panicked { page })??;
    Ok(CompressedFrame::new(page, resolution, data))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::frame::RasterImage;
    use super::*;

    struct TinyRenderer;

    impl PageRenderer for TinyRenderer {
        fn render(&self, page: PageIndex, _resolution: f64) -> Result<RasterImage, RenderError> {
            match page {
                13 => Err(RenderError::engine("unlucky page")),
                66 => panic!("renderer bug"),
                _ => Ok(RasterImage::new(2, 2)),
            }
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn reports_rendered_frame() {
        let (tx, rx) = flume::unbounded();
        let mut worker = RenderWorker::spawn(0, TinyRenderer, tx).unwrap();

        assert!(worker.assign(4, 1.25));
        assert_eq!(worker.assigned(), Some(4));
        // busy workers ignore new jobs
        assert!(!worker.assign(5, 1.25));

        let report = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(report.worker, 0);
        assert_eq!(report.page, 4);
        let frame = report.outcome.unwrap();
        assert_eq!(frame.page(), 4);
        assert_eq!(frame.resolution(), 1.25);

        assert_eq!(worker.finish(), Some(4));
        assert!(worker.is_idle());
    }

    #[test]
    fn reports_failures_and_panics() {
        let (tx, rx) = flume::unbounded();
        let mut worker = RenderWorker::spawn(1, TinyRenderer, tx).unwrap();

        worker.assign(13, 1.0);
        let report = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(report.outcome, Err(RenderError::Engine { .. })));
        worker.finish();

        worker.assign(66, 1.0);
        let report = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(
            report.outcome,
            Err(RenderError::Panicked { page: 66 })
        ));
        // the thread survives a renderer panic
        assert!(worker.is_alive());
    }

    #[test]
    fn shutdown_stops_thread() {
        let (tx, _rx) = flume::unbounded();
        let mut worker = RenderWorker::spawn(2, TinyRenderer, tx).unwrap();
        worker.request_shutdown();

        let deadline = Instant::now() + WAIT;
        while !worker.join_if_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_alive());
    }
}
