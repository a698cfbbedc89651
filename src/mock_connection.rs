//! Scripted [`Connection`] for exercising the transport and capture engine
//! without an instrument.

use std::collections::VecDeque;
use std::io::ErrorKind;

use crate::connection::{ChunkRead, Connection, ConnectionSettings};
use crate::transport::TransportError;

#[derive(Debug, Clone)]
enum ScriptedRead {
    Data(Vec<u8>),
    EndOfStream,
    Error(ErrorKind),
}

/// Replays queued reads in order and records every write.
///
/// Data larger than the requested read size is split, the remainder stays
/// at the front of the queue. Once the queue is empty every read reports
/// end of stream, like an instrument that has gone quiet.
///
/// An end-of-stream entry also marks how far input has arrived:
/// `clear_input` discards queued data up to and including the next one.
#[derive(Debug, Default)]
pub struct MockConnection {
    reads: VecDeque<ScriptedRead>,
    writes: Vec<Vec<u8>>,
    write_attempts: usize,
    failing_writes: usize,
    reads_performed: usize,
    inputs_cleared: usize,
    settings: ConnectionSettings,
    applied: Vec<ConnectionSettings>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_data(&mut self, data: &[u8]) {
        self.reads.push_back(ScriptedRead::Data(data.to_vec()));
    }

    pub fn push_end_of_stream(&mut self) {
        self.reads.push_back(ScriptedRead::EndOfStream);
    }

    pub fn push_error(&mut self, kind: ErrorKind) {
        self.reads.push_back(ScriptedRead::Error(kind));
    }

    /// Make the next `count` writes fail with a broken pipe.
    pub fn fail_next_writes(&mut self, count: usize) {
        self.failing_writes = count;
    }

    /// Successful writes, terminators included.
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts
    }

    /// Successful writes as text with terminators removed.
    pub fn written_commands(&self) -> Vec<String> {
        self.writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim_end().to_string())
            .collect()
    }

    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn reads_performed(&self) -> usize {
        self.reads_performed
    }

    pub fn inputs_cleared(&self) -> usize {
        self.inputs_cleared
    }

    /// Every settings change, in order.
    pub fn applied_settings(&self) -> &[ConnectionSettings] {
        &self.applied
    }
}

impl Connection for MockConnection {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.write_attempts += 1;
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(std::io::Error::from(ErrorKind::BrokenPipe).into());
        }
        self.writes.push(data.to_vec());
        Ok(())
    }

    fn read_chunk(&mut self, max_len: usize) -> Result<ChunkRead, TransportError> {
        self.reads_performed += 1;
        match self.reads.pop_front() {
            None | Some(ScriptedRead::EndOfStream) => Ok(ChunkRead::EndOfStream),
            Some(ScriptedRead::Error(kind)) => Err(std::io::Error::from(kind).into()),
            Some(ScriptedRead::Data(mut data)) => {
                if data.len() > max_len {
                    let rest = data.split_off(max_len);
                    self.reads.push_front(ScriptedRead::Data(rest));
                }
                Ok(ChunkRead::Data(data))
            }
        }
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.inputs_cleared += 1;
        while let Some(ScriptedRead::Data(_) | ScriptedRead::EndOfStream) = self.reads.front() {
            if let Some(ScriptedRead::EndOfStream) = self.reads.pop_front() {
                break;
            }
        }
        Ok(())
    }

    fn settings(&self) -> ConnectionSettings {
        self.settings
    }

    fn apply_settings(&mut self, settings: ConnectionSettings) -> Result<(), TransportError> {
        self.applied.push(settings);
        self.settings = settings;
        Ok(())
    }
}
