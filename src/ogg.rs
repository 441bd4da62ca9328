//! Minimal Ogg/Opus writer for the audio uplink.
//!
//! Repackages Opus RTP payloads into an Ogg stream, one page per packet,
//! matching the container stream the transcription service expects: two
//! header pages (`OpusHead`, `OpusTags`) up front, then data pages whose
//! granule position follows the 48 kHz RTP clock.

use std::io::{self, Write};

const PAGE_SIGNATURE: &[u8; 4] = b"OggS";
const ID_SIGNATURE: &[u8; 8] = b"OpusHead";
const COMMENT_SIGNATURE: &[u8; 8] = b"OpusTags";
const VENDOR: &str = "babelbot";

const PAGE_HEADER_SIZE: usize = 27;
const PAGE_TYPE_DATA: u8 = 0x00;
const PAGE_TYPE_BEGINNING_OF_STREAM: u8 = 0x02;

/// Ogg CRC-32: polynomial 0x04C11DB7, init 0, unreflected, no final xor.
fn build_checksum_table() -> [u32; 256] {
    const POLY: u32 = 0x04C1_1DB7;
    let mut table = [0u32; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ POLY
            } else {
                r << 1
            };
            j += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

pub struct OggWriter<W: Write> {
    out: W,
    sample_rate: u32,
    channel_count: u16,
    serial: u32,
    page_index: u32,
    checksum_table: [u32; 256],
    // Granule and timestamp start from 1; only header pages carry 0.
    previous_granule_position: u64,
    previous_timestamp: u32,
}

impl<W: Write> OggWriter<W> {
    /// Create the writer and emit the `OpusHead`/`OpusTags` header pages.
    pub fn new(out: W, sample_rate: u32, channel_count: u16) -> io::Result<Self> {
        let mut writer = Self {
            out,
            sample_rate,
            channel_count,
            serial: rand::random(),
            page_index: 0,
            checksum_table: build_checksum_table(),
            previous_granule_position: 1,
            previous_timestamp: 1,
        };
        writer.write_headers()?;
        Ok(writer)
    }

    fn write_headers(&mut self) -> io::Result<()> {
        let mut id = [0u8; 19];
        id[..8].copy_from_slice(ID_SIGNATURE);
        id[8] = 1; // version
        id[9] = self.channel_count as u8;
        id[10..12].copy_from_slice(&0u16.to_le_bytes()); // pre-skip
        id[12..16].copy_from_slice(&self.sample_rate.to_le_bytes());
        id[16..18].copy_from_slice(&0u16.to_le_bytes()); // output gain
        id[18] = 0; // channel mapping family
        let page = self.create_page(&id, PAGE_TYPE_BEGINNING_OF_STREAM, 0);
        self.out.write_all(&page)?;

        let vendor = VENDOR.as_bytes();
        let mut comment = Vec::with_capacity(16 + vendor.len());
        comment.extend_from_slice(COMMENT_SIGNATURE);
        comment.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        comment.extend_from_slice(vendor);
        comment.extend_from_slice(&0u32.to_le_bytes()); // user comment count
        let page = self.create_page(&comment, PAGE_TYPE_DATA, 0);
        self.out.write_all(&page)
    }

    fn create_page(&mut self, payload: &[u8], header_type: u8, granule_position: u64) -> Vec<u8> {
        let n_segments = payload.len() / 255 + 1;
        let mut page = Vec::with_capacity(PAGE_HEADER_SIZE + n_segments + payload.len());
        page.extend_from_slice(PAGE_SIGNATURE);
        page.push(0); // stream structure version
        page.push(header_type);
        page.extend_from_slice(&granule_position.to_le_bytes());
        page.extend_from_slice(&self.serial.to_le_bytes());
        page.extend_from_slice(&self.page_index.to_le_bytes());
        page.extend_from_slice(&[0u8; 4]); // checksum, patched below
        page.push(n_segments as u8);
        // 255-run lacing; the short trailing value terminates the packet.
        for _ in 0..n_segments - 1 {
            page.push(255);
        }
        page.push((payload.len() % 255) as u8);
        page.extend_from_slice(payload);

        let mut checksum = 0u32;
        for &byte in &page {
            checksum = (checksum << 8)
                ^ self.checksum_table[(((checksum >> 24) as u8) ^ byte) as usize];
        }
        page[22..26].copy_from_slice(&checksum.to_le_bytes());

        self.page_index += 1;
        page
    }

    /// Write one RTP packet's Opus payload as an Ogg page. Empty payloads
    /// are skipped.
    pub fn write_rtp(&mut self, packet: &rtp::packet::Packet) -> io::Result<()> {
        if packet.payload.is_empty() {
            return Ok(());
        }

        if self.previous_timestamp == 1 {
            self.previous_granule_position = 961;
        } else {
            let increment = packet
                .header
                .timestamp
                .wrapping_sub(self.previous_timestamp);
            self.previous_granule_position =
                self.previous_granule_position.wrapping_add(u64::from(increment));
        }
        self.previous_timestamp = packet.header.timestamp;

        let page = self.create_page(
            &packet.payload,
            PAGE_TYPE_DATA,
            self.previous_granule_position,
        );
        self.out.write_all(&page)
    }

    /// Flush the sink. The stream carries no end-of-stream page; the
    /// transcription service treats a dead uplink as the end.
    pub fn close(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    #[cfg(test)]
    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct Page {
        header_type: u8,
        granule: u64,
        serial: u32,
        index: u32,
        crc: u32,
        lacing: Vec<u8>,
        payload: Vec<u8>,
    }

    fn parse_pages(mut buf: &[u8]) -> Vec<Page> {
        let mut pages = Vec::new();
        while !buf.is_empty() {
            assert_eq!(&buf[..4], PAGE_SIGNATURE);
            assert_eq!(buf[4], 0);
            let header_type = buf[5];
            let granule = u64::from_le_bytes(buf[6..14].try_into().unwrap());
            let serial = u32::from_le_bytes(buf[14..18].try_into().unwrap());
            let index = u32::from_le_bytes(buf[18..22].try_into().unwrap());
            let crc = u32::from_le_bytes(buf[22..26].try_into().unwrap());
            let n_segments = buf[26] as usize;
            let lacing = buf[27..27 + n_segments].to_vec();
            let payload_len: usize = lacing.iter().map(|&l| l as usize).sum();
            let start = 27 + n_segments;
            let payload = buf[start..start + payload_len].to_vec();
            buf = &buf[start + payload_len..];
            pages.push(Page {
                header_type,
                granule,
                serial,
                index,
                crc,
                lacing,
                payload,
            });
        }
        pages
    }

    fn opus_packet(timestamp: u32, payload: &[u8]) -> rtp::packet::Packet {
        let mut packet = rtp::packet::Packet::default();
        packet.header.timestamp = timestamp;
        packet.payload = Bytes::copy_from_slice(payload);
        packet
    }

    #[test]
    fn test_header_pages() {
        let writer = OggWriter::new(Vec::new(), 48_000, 2).unwrap();
        let pages = parse_pages(writer.get_ref());
        assert_eq!(pages.len(), 2);

        let id = &pages[0];
        assert_eq!(id.header_type, PAGE_TYPE_BEGINNING_OF_STREAM);
        assert_eq!(id.granule, 0);
        assert_eq!(id.index, 0);
        assert_eq!(&id.payload[..8], ID_SIGNATURE);
        assert_eq!(id.payload[9], 2); // channel count
        assert_eq!(
            u32::from_le_bytes(id.payload[12..16].try_into().unwrap()),
            48_000
        );

        let tags = &pages[1];
        assert_eq!(tags.index, 1);
        assert_eq!(&tags.payload[..8], COMMENT_SIGNATURE);
        assert_eq!(tags.serial, id.serial);
        assert_ne!(tags.crc, 0);
    }

    #[test]
    fn test_granule_tracks_rtp_timestamps() {
        let mut writer = OggWriter::new(Vec::new(), 48_000, 2).unwrap();
        writer.write_rtp(&opus_packet(1000, b"frame-a")).unwrap();
        writer.write_rtp(&opus_packet(1960, b"frame-b")).unwrap();
        writer.write_rtp(&opus_packet(2920, b"frame-c")).unwrap();

        let pages = parse_pages(writer.get_ref());
        assert_eq!(pages.len(), 5);
        assert_eq!(pages[2].granule, 961);
        assert_eq!(pages[3].granule, 961 + 960);
        assert_eq!(pages[4].granule, 961 + 1920);
        assert_eq!(pages[2].payload, b"frame-a");
        assert_eq!(pages[4].index, 4);
    }

    #[test]
    fn test_empty_payload_is_skipped() {
        let mut writer = OggWriter::new(Vec::new(), 48_000, 2).unwrap();
        writer.write_rtp(&opus_packet(1000, b"")).unwrap();
        assert_eq!(parse_pages(writer.get_ref()).len(), 2);
    }

    #[test]
    fn test_lacing_for_long_payload() {
        let mut writer = OggWriter::new(Vec::new(), 48_000, 2).unwrap();
        let payload = vec![0xAAu8; 300];
        writer.write_rtp(&opus_packet(1000, &payload)).unwrap();

        let pages = parse_pages(writer.get_ref());
        let data = &pages[2];
        assert_eq!(data.lacing, vec![255, 45]);
        assert_eq!(data.payload.len(), 300);
    }

    #[test]
    fn test_checksum_is_patched_consistently() {
        let mut writer = OggWriter::new(Vec::new(), 48_000, 2).unwrap();
        writer.write_rtp(&opus_packet(1000, b"frame")).unwrap();

        let table = build_checksum_table();
        let raw = writer.get_ref().clone();
        for page in split_raw_pages(&raw) {
            let mut zeroed = page.clone();
            zeroed[22..26].copy_from_slice(&[0u8; 4]);
            let mut checksum = 0u32;
            for &byte in &zeroed {
                checksum =
                    (checksum << 8) ^ table[(((checksum >> 24) as u8) ^ byte) as usize];
            }
            let stored = u32::from_le_bytes(page[22..26].try_into().unwrap());
            assert_eq!(checksum, stored);
        }
    }

    fn split_raw_pages(mut buf: &[u8]) -> Vec<Vec<u8>> {
        let mut raw = Vec::new();
        while !buf.is_empty() {
            let n_segments = buf[26] as usize;
            let payload_len: usize = buf[27..27 + n_segments].iter().map(|&l| l as usize).sum();
            let total = 27 + n_segments + payload_len;
            raw.push(buf[..total].to_vec());
            buf = &buf[total..];
        }
        raw
    }
}
