use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::buffer::PageId;
use crate::error::{CorvusError, CorvusResult};
use crate::storage::disk_manager::DiskManager;

// Sender/receiver halves of a per-request completion channel.
pub type DiskCommandResultSender<T> = Sender<CorvusResult<T>>;
pub type DiskCommandResultReceiver<T> = Receiver<CorvusResult<T>>;

/// Commands sent from the buffer pool to the scheduler worker. The buffer a
/// request refers to travels inside the request, so it stays valid until the
/// completion signal fires.
#[derive(Debug)]
pub enum DiskRequest {
    ReadPage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<BytesMut>,
    },
    WritePage {
        page_id: PageId,
        data: Bytes,
        result_sender: DiskCommandResultSender<()>,
    },
    DeallocatePage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<()>,
    },
    Shutdown,
}

/// Single serialization point for physical I/O: exactly one worker thread
/// consumes the request queue and performs I/O synchronously through the
/// disk manager. Requests for the same page execute in enqueue order; no
/// ordering is promised across pages.
#[derive(Debug)]
pub struct DiskScheduler {
    request_sender: Sender<DiskRequest>,
    worker_thread: Option<thread::JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<dyn DiskManager>) -> Self {
        let (request_sender, request_receiver) = mpsc::channel::<DiskRequest>();

        let worker_thread = thread::Builder::new()
            .name("disk-scheduler-worker".to_string())
            .spawn(move || {
                Self::io_worker_loop(request_receiver, disk_manager);
            })
            .expect("Failed to spawn DiskScheduler worker thread");

        DiskScheduler {
            request_sender,
            worker_thread: Some(worker_thread),
        }
    }

    fn io_worker_loop(receiver: Receiver<DiskRequest>, disk_manager: Arc<dyn DiskManager>) {
        debug!("Disk I/O worker thread started.");
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::ReadPage {
                    page_id,
                    result_sender,
                } => {
                    let result = disk_manager
                        .read_page(page_id)
                        .map(|data| BytesMut::from(&data[..]));
                    if result_sender.send(result).is_err() {
                        log::error!("DiskScheduler failed to send ReadPage result for {}", page_id);
                    }
                }
                DiskRequest::WritePage {
                    page_id,
                    data,
                    result_sender,
                } => {
                    let result = disk_manager.write_page(page_id, &data);
                    if result_sender.send(result).is_err() {
                        log::error!(
                            "DiskScheduler failed to send WritePage result for {}",
                            page_id
                        );
                    }
                }
                DiskRequest::DeallocatePage {
                    page_id,
                    result_sender,
                } => {
                    let result = disk_manager.deallocate_page(page_id);
                    if result_sender.send(result).is_err() {
                        log::error!(
                            "DiskScheduler failed to send DeallocatePage result for {}",
                            page_id
                        );
                    }
                }
                DiskRequest::Shutdown => {
                    debug!("Disk I/O worker thread received Shutdown signal.");
                    break;
                }
            }
        }
        debug!("Disk I/O worker thread finished.");
    }

    /// Enqueue a batch of requests in order.
    pub fn schedule(&self, requests: Vec<DiskRequest>) -> CorvusResult<()> {
        for request in requests {
            self.request_sender
                .send(request)
                .map_err(|e| CorvusError::Internal(format!("Failed to send request: {}", e)))?;
        }
        Ok(())
    }

    pub fn schedule_read(
        &self,
        page_id: PageId,
    ) -> CorvusResult<DiskCommandResultReceiver<BytesMut>> {
        let (tx, rx) = mpsc::channel();
        self.schedule(vec![DiskRequest::ReadPage {
            page_id,
            result_sender: tx,
        }])?;
        Ok(rx)
    }

    pub fn schedule_write(
        &self,
        page_id: PageId,
        data: Bytes,
    ) -> CorvusResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.schedule(vec![DiskRequest::WritePage {
            page_id,
            data,
            result_sender: tx,
        }])?;
        Ok(rx)
    }

    pub fn schedule_deallocate(
        &self,
        page_id: PageId,
    ) -> CorvusResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.schedule(vec![DiskRequest::DeallocatePage {
            page_id,
            result_sender: tx,
        }])?;
        Ok(rx)
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        // Ignore the error if the channel is already closed.
        let _ = self.request_sender.send(DiskRequest::Shutdown);
        if let Some(handle) = self.worker_thread.take() {
            if let Err(e) = handle.join() {
                log::error!("Disk worker thread panicked: {:?}", e);
            }
        }
    }
}
