//! News-board storage.
//!
//! One directory per destination under the configured base path, holding
//! an append-only `INDEX.DAT` of fixed 83-byte rows plus the payload
//! files: `NNNNN.DAT` (121-byte text record) or `NNNNN.JPG` (raw JPEG).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use chrono::Local;
use tracing::{debug, info, warn};

pub const INDEX_RECORD_LEN: u64 = 83;
const TEXT_RECORD_LEN: usize = 121;
const LIST_ROW_LEN: usize = 47;
const PICTURE_CHUNK: usize = 1024;

/// Outcome of a `get_message` lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Picture,
}

/// A parsed news record heading for the index.
#[derive(Debug, Clone)]
struct NewsRecord {
    gps_pos: [u8; 18],
    token: [u8; 6],
    time_recv: [u8; 12],
    rtype: [u8; 3],
    time_send: [u8; 12],
    callsign: [u8; 10],
    subject: [u8; 16],
    to: [u8; 5],
    text: [u8; 80],
}

impl NewsRecord {
    /// Parse the common upload layout: optional 18-byte GPS prefix, then
    /// token, receive/send times, destination, and text or subject.
    fn parse(data: &[u8], source: &[u8], gps: bool) -> Self {
        let off = if gps { 18 } else { 0 };
        let mut record = Self {
            gps_pos: [0u8; 18],
            token: [b' '; 6],
            time_recv: [b' '; 12],
            rtype: *b"T01",
            time_send: [b' '; 12],
            callsign: [b' '; 10],
            subject: [b' '; 16],
            to: [b' '; 5],
            text: [b' '; 80],
        };
        if gps {
            record.gps_pos.copy_from_slice(&data[..18]);
        }
        copy_field(&mut record.token, &data[off..off + 6]);
        copy_field(&mut record.time_recv, &data[off + 6..off + 18]);
        copy_field(&mut record.time_send, &data[off + 18..off + 30]);
        copy_field(&mut record.to, &data[off + 30..off + 35]);
        copy_field(&mut record.callsign, &source[..source.len().min(10)]);
        if record.time_recv.iter().all(|&b| b == b' ' || b == 0) {
            let stamp = Local::now().format("%Y%m%d%H%M").to_string();
            copy_field(&mut record.time_recv, stamp.as_bytes());
        }
        record
    }

    fn index_row(&self, number: u32) -> [u8; INDEX_RECORD_LEN as usize] {
        let mut row = [b' '; INDEX_RECORD_LEN as usize];
        row[0..18].copy_from_slice(&self.gps_pos);
        row[18..24].copy_from_slice(&self.token);
        row[24..36].copy_from_slice(&self.time_recv);
        row[36..41].copy_from_slice(format!("{:05}", number).as_bytes());
        row[41..44].copy_from_slice(&self.rtype);
        row[44..56].copy_from_slice(&self.time_send);
        row[56..66].copy_from_slice(&self.callsign);
        row[66..82].copy_from_slice(&self.subject);
        row[82] = 0x0D;
        row
    }
}

fn copy_field(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
}

struct PendingPicture {
    record: NewsRecord,
    file: File,
    dest: String,
    written: u64,
}

struct PictureDownload {
    file: File,
    size: u32,
    seq: u8,
    sum_check: u32,
}

/// The flat-file news store. Owned exclusively by the WIRES-X engine.
pub struct WiresXStorage {
    base: PathBuf,
    upload: Option<PendingPicture>,
    download: Option<PictureDownload>,
}

impl WiresXStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into(), upload: None, download: None }
    }

    fn dest_dir(&self, dest: &str) -> PathBuf {
        self.base.join(dest)
    }

    fn index_path(&self, dest: &str) -> PathBuf {
        self.dest_dir(dest).join("INDEX.DAT")
    }

    fn payload_path(&self, dest: &str, number: u32, ext: &str) -> PathBuf {
        self.dest_dir(dest).join(format!("{:05}.{}", number, ext))
    }

    /// Next record number for a destination: one past the rows on disk.
    fn next_number(&self, dest: &str) -> u32 {
        match fs::metadata(self.index_path(dest)) {
            Ok(meta) => (meta.len() / INDEX_RECORD_LEN) as u32 + 1,
            Err(_) => 1,
        }
    }

    fn append_index(&self, record: &NewsRecord, dest: &str, number: u32) -> io::Result<()> {
        fs::create_dir_all(self.dest_dir(dest))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path(dest))?;
        file.write_all(&record.index_row(number))?;
        info!(number, rtype = %String::from_utf8_lossy(&record.rtype), dest, "news index updated");
        Ok(())
    }

    /// Store an uploaded text message; returns the record number.
    pub fn store_text_message(&mut self, data: &[u8], source: &[u8], gps: bool) -> Option<u32> {
        let mut record = NewsRecord::parse(data, source, gps);
        let off = if gps { 18 } else { 0 };
        record.rtype = *b"T01";
        copy_field(&mut record.text, &data[off + 45..off + 125]);

        let dest = field_string(&record.to);
        let number = self.next_number(&dest);
        if let Err(e) = self.append_index(&record, &dest, number) {
            warn!(error = %e, dest, "cannot update news index");
            return None;
        }

        let mut payload = [b' '; TEXT_RECORD_LEN];
        payload[0..10].copy_from_slice(&record.callsign);
        payload[10..22].copy_from_slice(&record.time_send);
        payload[22..40].copy_from_slice(&record.gps_pos);
        payload[40..120].copy_from_slice(&record.text);
        payload[120] = 0x0D;
        match File::create(self.payload_path(&dest, number, "DAT")) {
            Ok(mut file) => {
                if let Err(e) = file.write_all(&payload) {
                    warn!(error = %e, "cannot write message file");
                    return None;
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot create message file");
                return None;
            }
        }
        Some(number)
    }

    /// Begin a picture upload: parse the header fields and open the JPG.
    pub fn store_picture(&mut self, data: &[u8], source: &[u8], gps: bool) -> bool {
        let mut record = NewsRecord::parse(data, source, gps);
        let off = if gps { 18 } else { 0 };
        record.rtype = *b"P01";
        copy_field(&mut record.subject, &data[off + 45..off + 61]);

        let dest = field_string(&record.to);
        let number = self.next_number(&dest);
        if let Err(e) = fs::create_dir_all(self.dest_dir(&dest)) {
            warn!(error = %e, dest, "cannot create news directory");
            return false;
        }
        match File::create(self.payload_path(&dest, number, "JPG")) {
            Ok(file) => {
                self.upload = Some(PendingPicture { record, file, dest, written: 0 });
                true
            }
            Err(e) => {
                warn!(error = %e, "cannot create jpg file");
                false
            }
        }
    }

    /// Append one upload block. The caller strips the 5-byte chunk header;
    /// interior framing bytes at the fixed offsets are elided. Returns
    /// true when the block was the last one and the index row is written.
    pub fn add_picture_data(&mut self, data: &[u8], size: usize) -> bool {
        if let Some(upload) = self.upload.as_mut() {
            let result = if size > 771 {
                write_segments(&mut upload.file, data, &[(0, 250), (251, 510), (511, 770), (771, size)])
            } else if size > 511 {
                write_segments(&mut upload.file, data, &[(0, 250), (251, 510), (511, size)])
            } else if size > 251 {
                write_segments(&mut upload.file, data, &[(0, 250), (251, size)])
            } else {
                write_segments(&mut upload.file, data, &[(0, size)])
            };
            match result {
                Ok(written) => upload.written += written as u64,
                Err(e) => warn!(error = %e, "jpg write failed"),
            }
        } else {
            debug!("picture data block without an upload in progress");
            return false;
        }

        if size < 1027 {
            let mut upload = self.upload.take().expect("checked above");
            let _ = upload.file.flush();
            let final_size = upload.written;
            let kb_code = (final_size / 1000) + 1;
            upload.record.rtype = [b'P', b'0' + (kb_code / 10) as u8 % 10, b'0' + (kb_code % 10) as u8];
            let number = self.next_number(&upload.dest);
            if let Err(e) = self.append_index(&upload.record, &upload.dest, number) {
                warn!(error = %e, "cannot index uploaded picture");
            }
            return true;
        }
        false
    }

    /// Abort an unfinished upload (transfer watchdog).
    pub fn abort_upload(&mut self) {
        if self.upload.take().is_some() {
            warn!("picture upload aborted");
        }
    }

    /// Fill the list reply body for `out[..]`; returns the bytes used.
    ///
    /// `type_digit` is the request selector '1'..'4' mapping to the
    /// T/P/V/E record families.
    pub fn get_list(&mut self, out: &mut [u8], type_digit: u8, dest: &str, start: u32) -> usize {
        let mut offset = 15usize;
        let mut items = 0u32;
        let mut count = 0usize;

        let wanted = match type_digit {
            b'1' => b'T',
            b'2' => b'P',
            b'3' => b'V',
            b'4' => b'E',
            other => other,
        };

        if let Ok(mut file) = File::open(self.index_path(dest)) {
            let mut row = [0u8; INDEX_RECORD_LEN as usize];
            while file.read_exact(&mut row).is_ok() {
                if row[41] == wanted {
                    if items >= start && count < 20 {
                        out[offset..offset + LIST_ROW_LEN].copy_from_slice(&row[36..83]);
                        offset += LIST_ROW_LEN;
                        count += 1;
                    }
                    items += 1;
                }
            }
        } else {
            debug!(dest, "no news index for destination");
        }

        out[0..2].copy_from_slice(format!("{:02}", count + 1).as_bytes());
        copy_field(&mut out[2..7], dest.as_bytes());
        out[7..14].copy_from_slice(format!("     {:02}", count).as_bytes());
        out[14] = 0x0D;
        offset
    }

    /// Fill a message reply body starting at `out[5..]`.
    ///
    /// Text messages are complete in one reply; pictures return the
    /// preamble and leave the JPG open for chunk streaming.
    pub fn get_message(&mut self, out: &mut [u8], number: u32, dest: &str) -> Option<(usize, MessageKind)> {
        let jpg_path = self.payload_path(dest, number, "JPG");
        if let Ok(meta) = fs::metadata(&jpg_path) {
            let mut row = [0u8; INDEX_RECORD_LEN as usize];
            let mut index = File::open(self.index_path(dest)).ok()?;
            index
                .seek(SeekFrom::Start(INDEX_RECORD_LEN * (number as u64 - 1)))
                .ok()?;
            index.read_exact(&mut row).ok()?;

            let file = File::open(&jpg_path).ok()?;
            self.download = Some(PictureDownload {
                file,
                size: meta.len() as u32,
                seq: 0,
                sum_check: 0,
            });

            out[5..7].copy_from_slice(b"01");
            copy_field(&mut out[7..12], dest.as_bytes());
            out[12..17].fill(b' ');
            out[17..22].copy_from_slice(format!("{:05}", number).as_bytes());
            out[22..32].copy_from_slice(&row[56..66]); // callsign
            out[32..44].copy_from_slice(&row[44..56]); // time sent
            out[44..62].copy_from_slice(&row[0..18]); // gps
            out[62..78].copy_from_slice(&row[66..82]); // subject
            out[78] = 0x0D;
            Some((74, MessageKind::Picture))
        } else {
            let mut file = match File::open(self.payload_path(dest, number, "DAT")) {
                Ok(f) => f,
                Err(e) => {
                    debug!(error = %e, number, dest, "message not found");
                    return None;
                }
            };
            out[5..7].copy_from_slice(b"01");
            copy_field(&mut out[7..12], dest.as_bytes());
            out[12..22].copy_from_slice(format!("     {:05}", number).as_bytes());
            let mut payload = [0u8; TEXT_RECORD_LEN];
            if file.read_exact(&mut payload).is_err() {
                debug!(number, dest, "short message payload");
                return None;
            }
            out[22..22 + TEXT_RECORD_LEN].copy_from_slice(&payload);
            Some((138, MessageKind::Text))
        }
    }

    /// Fill the picture BEGIN body at `out[5..]`; returns the bytes used.
    pub fn get_picture_header(
        &mut self,
        out: &mut [u8],
        number: u32,
        dest: &str,
        talky_key: &[u8],
    ) -> Option<usize> {
        let index_path = self.index_path(dest);
        let download = self.download.as_mut()?;
        download.sum_check = 0;

        let mut row = [0u8; INDEX_RECORD_LEN as usize];
        let mut index = File::open(index_path).ok()?;
        index
            .seek(SeekFrom::Start(INDEX_RECORD_LEN * (number as u64 - 1)))
            .ok()?;
        index.read_exact(&mut row).ok()?;

        out[5..23].copy_from_slice(&row[0..18]); // gps
        out[23..30].copy_from_slice(&[0x50, 0x00, download.seq, 0x30, 0x00, 0x00, 0x00]);
        download.seq = download.seq.wrapping_add(1);
        out[30] = ((download.size >> 8) & 0xFF) as u8;
        out[31] = (download.size & 0xFF) as u8;
        out[32..34].copy_from_slice(b"20");
        out[34..46].copy_from_slice(&row[24..36]); // time received
        copy_field(&mut out[46..52], talky_key);
        out[52..62].copy_from_slice(format!("{:06}.jpg", number).as_bytes());
        out[62..80].copy_from_slice(&row[0..18]); // gps again
        out[80..96].copy_from_slice(&row[66..82]); // subject
        Some(91)
    }

    /// Read the next DATA chunk: 5-byte chunk header at `out[..5]`, up to
    /// 1024 payload bytes after it. Returns the payload length.
    pub fn get_picture_data(&mut self, out: &mut [u8], offset: u32) -> usize {
        let Some(download) = self.download.as_mut() else {
            return 0;
        };
        let mut header = [0x50u8, 0x00, download.seq, 0x00, 0x00];
        download.seq = download.seq.wrapping_add(1);

        let remaining = download.size.saturating_sub(offset) as usize;
        let want = if remaining < PICTURE_CHUNK {
            header[3] = ((remaining >> 8) & 0xFF) as u8;
            header[4] = (remaining & 0xFF) as u8;
            remaining
        } else {
            PICTURE_CHUNK
        };

        out[..5].copy_from_slice(&header);
        let n = download.file.read(&mut out[5..5 + want]).unwrap_or(0);
        for &b in &out[5..5 + n] {
            download.sum_check = download.sum_check.wrapping_add(b as u32);
        }
        n
    }

    pub fn picture_seq(&self) -> u8 {
        self.download.as_ref().map(|d| d.seq).unwrap_or(0)
    }

    pub fn sum_check(&self) -> u32 {
        self.download.as_ref().map(|d| d.sum_check).unwrap_or(0)
    }

    pub fn picture_size(&self) -> u32 {
        self.download.as_ref().map(|d| d.size).unwrap_or(0)
    }

    /// Drop the open download stream.
    pub fn end_download(&mut self) {
        self.download = None;
    }
}

fn field_string(field: &[u8]) -> String {
    String::from_utf8_lossy(field).trim().to_string()
}

fn write_segments(file: &mut File, data: &[u8], segments: &[(usize, usize)]) -> io::Result<usize> {
    let mut written = 0;
    for &(from, to) in segments {
        let to = to.min(data.len());
        if from >= to {
            continue;
        }
        file.write_all(&data[from..to])?;
        written += to - from;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_payload(to: &str, text: &str) -> Vec<u8> {
        // token(6) + time_recv(12) + time_send(12) + to(5) + pad(10) + body
        let mut data = Vec::new();
        data.extend_from_slice(b"SER001");
        data.extend_from_slice(b"202501021200");
        data.extend_from_slice(b"202501021159");
        data.extend_from_slice(format!("{:<5}", to).as_bytes());
        data.extend_from_slice(&[b' '; 10]);
        let mut body = [b' '; 80];
        copy_field(&mut body, text.as_bytes());
        data.extend_from_slice(&body);
        data.extend_from_slice(&[b' '; 40]);
        data
    }

    #[test]
    fn test_text_message_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = WiresXStorage::new(dir.path());
        let data = upload_payload("21400", "hello world");
        let number = storage.store_text_message(&data, b"EA7EE     ", false).unwrap();
        assert_eq!(number, 1);

        let index = fs::read(dir.path().join("21400/INDEX.DAT")).unwrap();
        assert_eq!(index.len(), 83);
        assert_eq!(index[82], 0x0D);
        assert_eq!(&index[36..41], b"00001");
        assert!(index[36..41].iter().all(u8::is_ascii_digit));
        assert_eq!(&index[41..44], b"T01");
        assert_eq!(&index[56..66], b"EA7EE     ");

        let payload = fs::read(dir.path().join("21400/00001.DAT")).unwrap();
        assert_eq!(payload.len(), 121);
        assert_eq!(payload[120], 0x0D);
        assert_eq!(&payload[40..51], b"hello world");

        // Second message gets the next number
        let number = storage.store_text_message(&data, b"EA7EE     ", false).unwrap();
        assert_eq!(number, 2);
    }

    #[test]
    fn test_get_list_filters_and_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = WiresXStorage::new(dir.path());
        let data = upload_payload("21400", "msg");
        for _ in 0..15 {
            storage.store_text_message(&data, b"EA7EE     ", false).unwrap();
        }
        // A picture row appended: must be filtered out of 'T' listings
        assert!(storage.store_picture(&data, b"EA7EE     ", false));
        assert!(storage.add_picture_data(&[0u8; 100], 100));
        let index = fs::read(dir.path().join("21400/INDEX.DAT")).unwrap();
        assert_eq!(index.len(), 16 * 83);
        assert_eq!(&index[15 * 83 + 41..15 * 83 + 44], b"P01");

        let mut out = [0u8; 1100];
        let len = storage.get_list(&mut out, b'1', "21400", 0);
        assert_eq!(len, 15 + 15 * 47);
        assert_eq!(&out[0..2], b"16"); // count + 1
        assert_eq!(&out[2..7], b"21400");
        assert_eq!(&out[7..14], b"     15");
        assert_eq!(out[14], 0x0D);
        // First row carries the record number and type
        assert_eq!(&out[15..20], b"00001");
        assert_eq!(&out[20..23], b"T01");

        let len = storage.get_list(&mut out, b'2', "21400", 0);
        assert_eq!(len, 15 + 47);

        // Paging skips the first `start` matches
        let len = storage.get_list(&mut out, b'1', "21400", 10);
        assert_eq!(len, 15 + 5 * 47);
    }

    #[test]
    fn test_picture_upload_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = WiresXStorage::new(dir.path());
        let data = upload_payload("21400", "subject line");
        assert!(storage.store_picture(&data, b"EA7EE     ", false));

        // 1500-byte image arrives as one full block and one short block;
        // blocks carry framing bytes at 250, 510 and 770 that are elided.
        let block: Vec<u8> = (0..1027).map(|i| (i % 251) as u8).collect();
        assert!(!storage.add_picture_data(&block, block.len()));
        let tail: Vec<u8> = (0..480).map(|i| (i % 101) as u8).collect();
        assert!(storage.add_picture_data(&tail, tail.len()));

        let jpg = fs::read(dir.path().join("21400/00001.JPG")).unwrap();
        assert_eq!(jpg.len(), 250 + 259 + 259 + (1027 - 771) + 250 + (480 - 251));

        let index = fs::read(dir.path().join("21400/INDEX.DAT")).unwrap();
        assert_eq!(&index[41..42], b"P");

        // Download side
        let mut out = [0u8; 1100];
        let (len, kind) = storage.get_message(&mut out, 1, "21400").unwrap();
        assert_eq!(kind, MessageKind::Picture);
        assert_eq!(len, 74);
        assert_eq!(out[78], 0x0D);

        let header_len = storage
            .get_picture_header(&mut out, 1, "21400", b"HE5Gbv")
            .unwrap();
        assert_eq!(header_len, 91);
        let size = storage.picture_size();
        assert_eq!(size as usize, jpg.len());
        assert_eq!(out[30], (size >> 8) as u8);
        assert_eq!(out[31], (size & 0xFF) as u8);
        assert_eq!(&out[46..52], b"HE5Gbv");

        // Stream it back: running checksum matches the payload sum
        let mut total = 0u32;
        let mut sum = 0u32;
        loop {
            let n = storage.get_picture_data(&mut out, total);
            if n == 0 {
                break;
            }
            for &b in &out[5..5 + n] {
                sum = sum.wrapping_add(b as u32);
            }
            total += n as u32;
            if n < PICTURE_CHUNK {
                break;
            }
        }
        assert_eq!(total, size);
        assert_eq!(storage.sum_check(), sum);
        storage.end_download();
    }

    #[test]
    fn test_get_message_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = WiresXStorage::new(dir.path());
        let data = upload_payload("21400", "the body");
        storage.store_text_message(&data, b"EA7EE     ", false).unwrap();

        let mut out = [0u8; 1100];
        let (len, kind) = storage.get_message(&mut out, 1, "21400").unwrap();
        assert_eq!(kind, MessageKind::Text);
        assert_eq!(len, 138);
        assert_eq!(&out[17..22], b"00001");
        assert_eq!(out[143 - 1], 0x0D); // text record terminator

        // Missing numbers answer None, voice path undisturbed
        assert!(storage.get_message(&mut out, 9, "21400").is_none());
    }
}
