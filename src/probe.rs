//! Media format detection from byte signatures.
//!
//! Uploads are classified by magic numbers only. The client-supplied filename
//! and content type are never consulted, so a renamed or mislabeled file
//! cannot reach the converter under the wrong identity.

/// Number of leading bytes [`detect`] needs to classify any supported format.
pub const PROBE_LEN: usize = 16;

/// Concrete container/codec identity of an upload.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MediaKind {
    Mp3,
    Wav,
    Flac,
    Ogg,
    M4a,
    Wma,
    Mp4,
    Matroska,
    Avi,
}

impl MediaKind {
    /// Lowercase name used in logs and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::M4a => "m4a",
            Self::Wma => "wma",
            Self::Mp4 => "mp4",
            Self::Matroska => "matroska",
            Self::Avi => "avi",
        }
    }

    /// Filename extension for spooled temp files.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::M4a => "m4a",
            Self::Wma => "wma",
            Self::Mp4 => "mp4",
            Self::Matroska => "mkv",
            Self::Avi => "avi",
        }
    }

    /// Whether the container may carry a video stream to strip before
    /// transcription.
    pub fn is_video(self) -> bool {
        matches!(self, Self::Mp4 | Self::Matroska | Self::Avi)
    }
}

const ASF_GUID: [u8; 16] = [
    0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11, 0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62, 0xCE, 0x6C,
];

/// Classifies raw bytes by signature, or `None` when unrecognized.
///
/// Only the first [`PROBE_LEN`] bytes are inspected; callers may pass a
/// truncated prefix of the upload.
pub fn detect(bytes: &[u8]) -> Option<MediaKind> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" {
        if &bytes[8..12] == b"WAVE" {
            return Some(MediaKind::Wav);
        }
        if &bytes[8..12] == b"AVI " {
            return Some(MediaKind::Avi);
        }
        return None;
    }

    if bytes.starts_with(b"fLaC") {
        return Some(MediaKind::Flac);
    }

    if bytes.starts_with(b"OggS") {
        return Some(MediaKind::Ogg);
    }

    if bytes.starts_with(b"ID3") {
        return Some(MediaKind::Mp3);
    }

    if bytes.len() >= 2 && is_mpeg_frame_sync(bytes[0], bytes[1]) {
        return Some(MediaKind::Mp3);
    }

    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return Some(classify_bmff_brand(&bytes[8..12]));
    }

    if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(MediaKind::Matroska);
    }

    if bytes.len() >= PROBE_LEN && bytes[0..PROBE_LEN] == ASF_GUID {
        return Some(MediaKind::Wma);
    }

    None
}

/// Checks the first two bytes for an MPEG audio frame header.
///
/// Requires the 11-bit sync pattern plus non-reserved version and layer
/// fields, so arbitrary `0xFF`-prefixed binaries do not pass as MP3.
fn is_mpeg_frame_sync(b0: u8, b1: u8) -> bool {
    if b0 != 0xFF || (b1 & 0xE0) != 0xE0 {
        return false;
    }
    let version = (b1 >> 3) & 0x03;
    let layer = (b1 >> 1) & 0x03;
    version != 0x01 && layer != 0x00
}

fn classify_bmff_brand(brand: &[u8]) -> MediaKind {
    match brand {
        b"M4A " | b"M4B " => MediaKind::M4a,
        // Everything else in the ISO-BMFF family (isom, mp41, mp42, avc1,
        // qt, 3gp, dash) is treated as video; the converter strips the
        // video stream either way.
        _ => MediaKind::Mp4,
    }
}

#[cfg(test)]
mod tests {
    use super::{detect, MediaKind};

    fn with_header(header: &[u8]) -> Vec<u8> {
        let mut bytes = header.to_vec();
        bytes.resize(64, 0);
        bytes
    }

    #[test]
    fn detects_wav_and_avi_from_riff_subtype() {
        let mut wav = b"RIFF".to_vec();
        wav.extend_from_slice(&[0x24, 0x00, 0x00, 0x00]);
        wav.extend_from_slice(b"WAVEfmt ");
        assert_eq!(detect(&wav), Some(MediaKind::Wav));

        let mut avi = b"RIFF".to_vec();
        avi.extend_from_slice(&[0x24, 0x00, 0x00, 0x00]);
        avi.extend_from_slice(b"AVI LIST");
        assert_eq!(detect(&avi), Some(MediaKind::Avi));
        assert!(detect(&avi).unwrap().is_video());
    }

    #[test]
    fn detects_mp3_from_id3_tag() {
        assert_eq!(detect(&with_header(b"ID3\x04")), Some(MediaKind::Mp3));
    }

    #[test]
    fn detects_mp3_from_frame_sync() {
        assert_eq!(detect(&with_header(&[0xFF, 0xFB, 0x90])), Some(MediaKind::Mp3));
    }

    #[test]
    fn rejects_reserved_mpeg_version_bits() {
        // Sync bits present but version field is reserved.
        assert_eq!(detect(&with_header(&[0xFF, 0xEB, 0x90])), None);
    }

    #[test]
    fn detects_flac_ogg_and_matroska() {
        assert_eq!(detect(&with_header(b"fLaC\0\0\0")), Some(MediaKind::Flac));
        assert_eq!(detect(&with_header(b"OggS\0\x02")), Some(MediaKind::Ogg));
        assert_eq!(
            detect(&with_header(&[0x1A, 0x45, 0xDF, 0xA3])),
            Some(MediaKind::Matroska)
        );
    }

    #[test]
    fn splits_bmff_family_by_brand() {
        let mut m4a = vec![0x00, 0x00, 0x00, 0x20];
        m4a.extend_from_slice(b"ftypM4A ");
        assert_eq!(detect(&m4a), Some(MediaKind::M4a));
        assert!(!detect(&m4a).unwrap().is_video());

        let mut mp4 = vec![0x00, 0x00, 0x00, 0x20];
        mp4.extend_from_slice(b"ftypisom");
        assert_eq!(detect(&mp4), Some(MediaKind::Mp4));
        assert!(detect(&mp4).unwrap().is_video());
    }

    #[test]
    fn detects_asf_guid_as_wma() {
        let header = [
            0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11, 0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62,
            0xCE, 0x6C,
        ];
        assert_eq!(detect(&with_header(&header)), Some(MediaKind::Wma));
    }

    #[test]
    fn rejects_png_regardless_of_claimed_name() {
        // A PNG renamed to audio.mp3 arrives as these bytes; the name never
        // reaches this layer.
        let png = with_header(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
        assert_eq!(detect(&png), None);
    }

    #[test]
    fn rejects_short_and_empty_buffers() {
        assert_eq!(detect(&[]), None);
        assert_eq!(detect(&[0x49]), None);
        assert_eq!(detect(b"RIFF"), None);
    }
}
