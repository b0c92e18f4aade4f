//! Serialized append of success records to the output file. One writer
//! task owns the file; probes only clone a channel sender.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    task::JoinHandle,
};

pub struct RecordSink {
    sender: Option<kanal::AsyncSender<String>>,
    writer: JoinHandle<()>,
}

impl RecordSink {
    /// Truncates `path` and starts the writer task. A path that cannot be
    /// created is fatal before the scan begins.
    pub async fn start<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        File::create(&path)
            .await
            .with_context(|| format!("cannot create output file {}", path.display()))?;

        let (sender, receiver) = kanal::bounded_async::<String>(capacity.max(1));
        let writer = tokio::spawn(async move {
            let mut file = match OpenOptions::new().append(true).open(&path).await {
                Ok(file) => file,
                Err(err) => {
                    log::error!("cannot reopen {}: {}", path.display(), err);
                    return;
                }
            };
            while let Ok(record) = receiver.recv().await {
                // Records arrive newline-terminated.
                if let Err(err) = file.write_all(record.as_bytes()).await {
                    log::error!("write to {} failed: {}", path.display(), err);
                }
            }
            if let Err(err) = file.flush().await {
                log::error!("flush of {} failed: {}", path.display(), err);
            }
        });
        Ok(Self {
            sender: Some(sender),
            writer,
        })
    }

    pub fn sender(&self) -> kanal::AsyncSender<String> {
        self.sender
            .as_ref()
            .expect("sink still open while handles exist")
            .clone()
    }

    /// Closes the channel and waits for the writer to drain and flush.
    pub async fn finish(mut self) {
        drop(self.sender.take());
        if let Err(err) = (&mut self.writer).await {
            log::error!("record writer panicked: {}", err);
        }
    }
}

/// Removes leftover `stream9527_*` capture files from the working
/// directory at the end of a run.
pub fn delete_stream_files() -> Result<()> {
    for entry in std::fs::read_dir(".").context("cannot read working directory")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("stream9527_") {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => log::info!("removed stream file {}", name),
                Err(err) => log::warn!("cannot remove {}: {}", name, err),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn truncates_then_appends_in_order() {
        let dir = std::env::temp_dir().join(format!("relayscan-sink-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("records.txt");
        std::fs::write(&path, "stale contents\n").unwrap();

        let sink = RecordSink::start(&path, 8).await.unwrap();
        let sender = sink.sender();
        sender.send("first\n".to_string()).await.unwrap();
        sender.send("second\n".to_string()).await.unwrap();
        drop(sender);
        sink.finish().await;

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "first\nsecond\n");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
