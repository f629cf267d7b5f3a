//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::demux::{Demultiplexer, Dispatcher, PendingRequest, Subscription};
use crate::error::ClientError;
use parking_lot::Mutex;
use printlink_protocol::{
    Command, FilePercentRecord, FileUpload, GCodeDoneRecord, PositionRecord, PrintStartRecord,
    PrintStopRecord, PrinterInfoRecord, Record, StateRecord, UploadRecord, ZOffsetRecord,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// High-level client for a printer.
pub struct Client {
    conn: Arc<Connection>,
    dispatcher: Arc<Dispatcher>,
    demux: Mutex<Option<Demultiplexer>>,
    /// Sequences the writes of one call against other calls.
    write_lock: tokio::sync::Mutex<()>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
            dispatcher: Arc::new(Dispatcher::new()),
            demux: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Connects to the printer and starts routing its frames.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await?;

        let demux = Demultiplexer::start(self.conn.clone(), self.dispatcher.clone());
        if let Some(previous) = self.demux.lock().replace(demux) {
            previous.shutdown();
        }
        Ok(())
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    ///
    /// Pending requests are abandoned, never resolved; subscriptions stop.
    pub fn close(&self) {
        if let Some(demux) = self.demux.lock().take() {
            demux.shutdown();
        }
        self.conn.close();
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Returns the dispatcher routing this client's frames.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn request<R: Record>(&self, command: Command) -> Result<R, ClientError> {
        tracing::debug!("Sending {}", command);
        let pending = self.dispatcher.register_request::<R>();
        let encoded = command.encode();

        let written = {
            let _guard = self.write_lock.lock().await;
            self.conn.send_all(&encoded).await
        };
        if let Err(e) = written {
            self.dispatcher.withdraw(pending.id());
            return Err(e);
        }

        self.wait(pending).await
    }

    async fn wait<R: Record>(&self, pending: PendingRequest<R>) -> Result<R, ClientError> {
        let Some(timeout) = self.conn.config().request_timeout else {
            return pending.wait().await;
        };

        match tokio::time::timeout(timeout, pending.wait()).await {
            Ok(result) => result,
            Err(_) => {
                if self.dispatcher.withdraw(pending.id()) {
                    tracing::debug!("Request for {} timed out", R::TAG);
                    return Err(ClientError::Timeout);
                }
                // Resolved between the deadline and the withdrawal.
                pending.try_take().ok_or(ClientError::Timeout)
            }
        }
    }

    // =========================================================================
    // Z offset
    // =========================================================================

    /// Sets the nozzle Z offset. The printer answers with the value it applied.
    pub async fn set_z_offset(&self, value: f64) -> Result<ZOffsetRecord, ClientError> {
        self.request(Command::SetZOffset(value)).await
    }

    /// Reads the nozzle Z offset.
    pub async fn get_z_offset(&self) -> Result<ZOffsetRecord, ClientError> {
        self.request(Command::GetZOffset).await
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Waits for the next state report the printer pushes. Sends nothing.
    pub async fn get_state(&self) -> Result<StateRecord, ClientError> {
        let pending = self.dispatcher.register_request::<StateRecord>();
        self.wait(pending).await
    }

    /// Reads printer identity and status.
    pub async fn get_printer_info(&self) -> Result<PrinterInfoRecord, ClientError> {
        self.request(Command::GetPrinterInfo).await
    }

    /// Moves the head's recorded position.
    pub async fn set_current_position(
        &self,
        x: f64,
        y: f64,
        z: f64,
    ) -> Result<PositionRecord, ClientError> {
        self.request(Command::SetPosition { x, y, z }).await
    }

    // =========================================================================
    // G-code and printing
    // =========================================================================

    /// Runs a batch of G-code lines.
    pub async fn execute_gcode<I, S>(&self, lines: I) -> Result<GCodeDoneRecord, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines = lines.into_iter().map(Into::into).collect();
        self.request(Command::GCode(lines)).await
    }

    /// Uploads a G-code file: a `filestart` announcement followed by the raw
    /// file data in fixed-size chunks.
    ///
    /// A missing file yields an unsuccessful record without touching the
    /// connection.
    pub async fn upload_gcode_file(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<UploadRecord, ClientError> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::debug!("Upload skipped, {} not found", path.display());
            return Ok(UploadRecord::failed(format!(
                "file not found: {}",
                path.display()
            )));
        }

        let mut upload = FileUpload::open(path).await?;
        tracing::debug!(
            "Uploading {} ({} bytes, {} chunks)",
            upload.name(),
            upload.size(),
            upload.chunk_count()
        );

        let pending = self.dispatcher.register_request::<UploadRecord>();
        let written = {
            let _guard = self.write_lock.lock().await;
            self.send_upload(&mut upload).await
        };
        if let Err(e) = written {
            self.dispatcher.withdraw(pending.id());
            return Err(e);
        }

        self.wait(pending).await
    }

    async fn send_upload(&self, upload: &mut FileUpload) -> Result<(), ClientError> {
        self.conn.send_all(&upload.preamble()).await?;
        while let Some(chunk) = upload.next_chunk().await? {
            self.conn.send_all(&chunk).await?;
        }
        Ok(())
    }

    /// Starts printing a file already stored on the printer.
    pub async fn start_print(&self, file_name: &str) -> Result<PrintStartRecord, ClientError> {
        self.request(Command::StartPrint(file_name.to_string())).await
    }

    /// Stops the current print.
    pub async fn stop_print(&self) -> Result<PrintStopRecord, ClientError> {
        self.request(Command::StopPrint).await
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Subscribes to state reports until `token` is cancelled.
    pub fn state_stream(&self, token: &CancellationToken) -> Subscription<StateRecord> {
        self.dispatcher.subscribe(token)
    }

    /// Subscribes to upload and print progress until `token` is cancelled.
    pub fn progress_stream(&self, token: &CancellationToken) -> Subscription<FilePercentRecord> {
        self.dispatcher.subscribe(token)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(demux) = self.demux.get_mut().take() {
            demux.shutdown();
        }
        self.conn.close();
    }
}
