use std::{
    io,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{fs::File, io::AsyncWriteExt as _, sync::mpsc};

const SNAPSHOT_LENGTH: usize = 1500;
const QUEUE_LIMIT: usize = 100;
const RECORD_HEADER_LENGTH: usize = 16;

// Nanosecond-resolution PCAP.
const PCAP_MAGIC: u32 = 0xA1B23C4D;
// LINKTYPE_RAW: packets begin with an IPv4 or IPv6 header.
const LINKTYPE_RAW: u16 = 101;

type PcapRecord = (Box<[u8; RECORD_HEADER_LENGTH + SNAPSHOT_LENGTH]>, usize);

/// Writes translated packets into a capture file.
///
/// The writer stops once every [`PcapSender`] has been dropped.
pub struct PcapWriter {
    file: File,
    rx: mpsc::Receiver<PcapRecord>,
}

impl PcapWriter {
    pub async fn new(path: &Path) -> Result<(PcapWriter, PcapSender), io::Error> {
        let mut file = File::create(path).await?;

        file.write_u32(PCAP_MAGIC).await?;
        file.write_u16(2).await?;
        file.write_u16(4).await?;
        file.write_u32(0).await?;
        file.write_u32(0).await?;
        file.write_u32(SNAPSHOT_LENGTH as u32).await?;
        file.write_u16(0).await?;
        file.write_u16(LINKTYPE_RAW).await?;

        let (tx, rx) = mpsc::channel(QUEUE_LIMIT);
        let sender = PcapSender {
            tx,
            data_lost: false,
        };
        Ok((PcapWriter { file, rx }, sender))
    }

    pub async fn run(mut self) {
        while let Some((record, length)) = self.rx.recv().await {
            if let Err(err) = self.file.write_all(&record[0..length]).await {
                log::error!("Failed to write packet to PCAP file: {err}");
            }
        }
        if let Err(err) = self.file.flush().await {
            log::error!("Failed to flush PCAP file: {err}");
        }
    }
}

#[derive(Clone)]
pub struct PcapSender {
    tx: mpsc::Sender<PcapRecord>,
    data_lost: bool,
}

impl PcapSender {
    pub fn send_packet(&mut self, packet: &[u8]) {
        if packet.is_empty() {
            return;
        }
        let time = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(time) => time,
            Err(err) => {
                log::warn!("Failed to convert time into UNIX for PCAP: {err}");
                return;
            }
        };
        let mut record = Box::new([0u8; RECORD_HEADER_LENGTH + SNAPSHOT_LENGTH]);
        let captured_length = write_record(&mut record[..], time, packet);

        if let Err(err) = self.tx.try_send((record, captured_length)) {
            if !self.data_lost {
                self.data_lost = true;
                log::error!("PCAP send buffer is full, some data will be lost: {err}");
            }
        }
    }
}

/// Writes a record header and the truncated packet, returns the record length.
fn write_record(dest: &mut [u8], time: Duration, packet: &[u8]) -> usize {
    let captured_length = packet.len().min(SNAPSHOT_LENGTH);
    dest[0..4].copy_from_slice(&(time.as_secs() as u32).to_be_bytes());
    dest[4..8].copy_from_slice(&time.subsec_nanos().to_be_bytes());
    dest[8..12].copy_from_slice(&(captured_length as u32).to_be_bytes());
    dest[12..16].copy_from_slice(&(packet.len() as u32).to_be_bytes());
    dest[RECORD_HEADER_LENGTH..RECORD_HEADER_LENGTH + captured_length]
        .copy_from_slice(&packet[0..captured_length]);
    RECORD_HEADER_LENGTH + captured_length
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_truncated_to_snapshot() {
        let mut dest = [0u8; RECORD_HEADER_LENGTH + SNAPSHOT_LENGTH];
        let packet = vec![0x45u8; SNAPSHOT_LENGTH + 20];
        let length = write_record(&mut dest, Duration::new(1_700_000_000, 5), &packet);
        assert_eq!(length, RECORD_HEADER_LENGTH + SNAPSHOT_LENGTH);
        assert_eq!(&dest[0..4], &1_700_000_000u32.to_be_bytes());
        assert_eq!(&dest[4..8], &5u32.to_be_bytes());
        assert_eq!(&dest[8..12], &(SNAPSHOT_LENGTH as u32).to_be_bytes());
        assert_eq!(&dest[12..16], &((SNAPSHOT_LENGTH + 20) as u32).to_be_bytes());
    }

    #[tokio::test]
    async fn writes_capture_file() {
        let path = std::env::temp_dir().join(format!("tunnel64-{}.pcap", std::process::id()));
        let (writer, mut sender) = PcapWriter::new(&path).await.unwrap();
        let writer = tokio::spawn(writer.run());
        sender.send_packet(&[0x60, 0, 0, 0]);
        sender.send_packet(&[]);
        drop(sender);
        writer.await.unwrap();

        let data = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(data.len(), 24 + RECORD_HEADER_LENGTH + 4);
        assert_eq!(&data[0..4], &PCAP_MAGIC.to_be_bytes());
        assert_eq!(&data[20..24], &[0, 0, 0, 101]);
        assert_eq!(&data[24 + 8..24 + 12], &4u32.to_be_bytes());
        assert_eq!(&data[24 + RECORD_HEADER_LENGTH..], &[0x60, 0, 0, 0]);
    }
}
