//! Convert stage
//!
//! Walks the frame queue each pass: evicts frames that left the cache
//! window, then migrates at most one hardware-resident frame to host memory
//! so the number of frames referenced inside the decoder stays bounded.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::context::Shared;

pub(crate) struct ConvertStage {
    pub shared: Arc<Shared>,
}

impl ConvertStage {
    pub fn run(self) {
        log::debug!("Enter convert stage");
        let shared = &self.shared;

        while !shared.prepared.load(Ordering::Acquire) && !shared.is_quit() {
            std::thread::sleep(shared.tuning.stage_poll);
        }

        while !shared.is_quit() {
            let mut idle = true;

            let candidate = shared.frames.sweep(
                shared.window_low(),
                shared.window_high(),
                shared.read_forward.load(Ordering::Acquire),
            );

            if let Some(frame) = candidate {
                match frame.migrate_to_host() {
                    Ok(migrated) => {
                        if migrated {
                            log::trace!(
                                "Migrated frame @{}ms ({}) to host memory",
                                frame.pos_ms(),
                                frame.pts()
                            );
                        }
                    }
                    Err(e) => {
                        // never serve a corrupted frame: drop it entirely
                        log::error!(
                            "Hardware frame transfer FAILED at pos {}({}): {e}. \
                             Discarding frame.",
                            frame.pos_ms(),
                            frame.pts()
                        );
                        shared.frames.remove(&frame);
                    }
                }
                idle = false;
            }

            if idle {
                std::thread::sleep(shared.tuning.stage_poll);
            }
        }
        log::debug!("Leave convert stage");
    }
}
