use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

use super::install_path_for;
use super::Bitstream;
use super::BitstreamError;
use super::BitstreamResult;
use super::ReadSeek;
use super::GBS_EXTENSION;
use crate::identity::canonize_id;

pub(crate) const GBS_GUID1: u64 = 0x4147_5046_6e6f_6558;
pub(crate) const GBS_GUID2: u64 = 0x3130_3076_5342_47b7;
const HEADER_LENGTH: u64 = 20;
const MAX_METADATA_LENGTH: u32 = 4096;

/// Fixed little-endian header at the start of every GBS file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub guid1: u64,
    pub guid2: u64,
    pub metadata_length: u32,
}

impl Header {
    fn from_bytes(bytes: &[u8; HEADER_LENGTH as usize]) -> Self {
        let mut guid1 = [0u8; 8];
        let mut guid2 = [0u8; 8];
        let mut length = [0u8; 4];
        guid1.copy_from_slice(&bytes[0..8]);
        guid2.copy_from_slice(&bytes[8..16]);
        length.copy_from_slice(&bytes[16..20]);

        Self {
            guid1: u64::from_le_bytes(guid1),
            guid2: u64::from_le_bytes(guid2),
            metadata_length: u32::from_le_bytes(length),
        }
    }
}

/// JSON metadata block of a GBS file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Metadata {
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform_name: String,
    #[serde(default)]
    pub afu_image: AfuImage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AfuImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic_no: Option<i64>,
    #[serde(default)]
    pub interface_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub afu_top_interface: Option<serde_json::Value>,
    #[serde(default)]
    pub power: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_frequency_high: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_frequency_low: Option<serde_json::Value>,
    #[serde(default)]
    pub accelerator_clusters: Vec<AcceleratorCluster>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AcceleratorCluster {
    #[serde(default)]
    pub accelerator_type_uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub total_contexts: i64,
}

#[derive(Debug)]
enum Source {
    File(File),
    Memory(Vec<u8>),
}

impl Source {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        match self {
            Source::File(file) => file.read_at(buf, offset),
            Source::Memory(data) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
        }
    }

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        match self {
            Source::File(file) => Ok(file.metadata()?.len()),
            Source::Memory(data) => Ok(data.len() as u64),
        }
    }
}

/// Independent read cursor over the payload range of a GBS.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    source: &'a Source,
    start: u64,
    size: u64,
    position: u64,
}

impl Read for PayloadReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.size {
            return Ok(0);
        }
        let remaining = self.size - self.position;
        let len = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self
            .source
            .read_at(&mut buf[..len], self.start + self.position)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for PayloadReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        self.position = target;
        Ok(target)
    }
}

/// A parsed GBS image.
#[derive(Debug)]
pub struct Gbs {
    pub header: Header,
    pub metadata: Metadata,
    source: Source,
    payload_offset: u64,
    payload_size: u64,
}

impl Gbs {
    /// Opens and validates the GBS file at `path`.
    pub fn open(path: &Path) -> BitstreamResult<Self> {
        let file = File::open(path).change_context_lazy(|| BitstreamError::Open {
            path: path.to_path_buf(),
        })?;
        Self::parse(Source::File(file))
            .attach_printable_lazy(|| format!("parsing {}", path.display()))
    }

    /// Parses a GBS image held in memory.
    pub fn from_bytes(data: Vec<u8>) -> BitstreamResult<Self> {
        Self::parse(Source::Memory(data))
    }

    fn parse(source: Source) -> BitstreamResult<Self> {
        let mut raw_header = [0u8; HEADER_LENGTH as usize];
        source
            .read_exact_at(&mut raw_header, 0)
            .change_context(BitstreamError::Header)?;
        let header = Header::from_bytes(&raw_header);

        if header.guid1 != GBS_GUID1 || header.guid2 != GBS_GUID2 {
            return Err(Report::new(BitstreamError::WrongMagic {
                guid1: header.guid1,
                guid2: header.guid2,
            }));
        }

        if header.metadata_length == 0 || header.metadata_length >= MAX_METADATA_LENGTH {
            return Err(Report::new(BitstreamError::MetadataLength {
                length: header.metadata_length,
            }));
        }

        let mut raw_metadata = vec![0u8; header.metadata_length as usize];
        source
            .read_exact_at(&mut raw_metadata, HEADER_LENGTH)
            .change_context(BitstreamError::Metadata)?;
        // only the first JSON value counts, trailing padding is tolerated
        let metadata: Metadata = serde_json::Deserializer::from_slice(&raw_metadata)
            .into_iter::<Metadata>()
            .next()
            .ok_or_else(|| Report::new(BitstreamError::Metadata))?
            .change_context(BitstreamError::Metadata)?;

        let clusters = metadata.afu_image.accelerator_clusters.len();
        if clusters != 1 {
            return Err(Report::new(BitstreamError::ClusterCount { count: clusters }));
        }

        let payload_offset = HEADER_LENGTH + u64::from(header.metadata_length);
        let total = source.len().change_context(BitstreamError::Payload)?;
        let payload_size = total.checked_sub(payload_offset).ok_or_else(|| {
            Report::new(BitstreamError::Payload).attach_printable(format!(
                "file size {total} is smaller than header and metadata"
            ))
        })?;

        Ok(Self {
            header,
            metadata,
            source,
            payload_offset,
            payload_size,
        })
    }

    /// Size of the raw payload in bytes.
    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    /// Reader over the raw payload with its own cursor.
    pub fn payload(&self) -> PayloadReader<'_> {
        PayloadReader {
            source: &self.source,
            start: self.payload_offset,
            size: self.payload_size,
            position: 0,
        }
    }
}

impl Bitstream for Gbs {
    fn raw_reader(&self) -> BitstreamResult<Box<dyn ReadSeek + '_>> {
        Ok(Box::new(self.payload()))
    }

    fn raw_data(&self) -> BitstreamResult<Vec<u8>> {
        let mut data = Vec::with_capacity(usize::try_from(self.payload_size).unwrap_or(0));
        self.payload()
            .read_to_end(&mut data)
            .change_context(BitstreamError::Payload)?;
        Ok(data)
    }

    fn interface_uuid(&self) -> String {
        canonize_id(&self.metadata.afu_image.interface_uuid)
    }

    fn accelerator_type_uuid(&self) -> String {
        match self.metadata.afu_image.accelerator_clusters.as_slice() {
            [cluster] => canonize_id(&cluster.accelerator_type_uuid),
            _ => String::new(),
        }
    }

    /// The AFU UUID identifies a GBS.
    fn unique_uuid(&self) -> String {
        self.accelerator_type_uuid()
    }

    fn install_path(&self, root: &Path) -> Option<PathBuf> {
        install_path_for(
            root,
            &self.interface_uuid(),
            &self.unique_uuid(),
            GBS_EXTENSION,
        )
    }

    fn extra_metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("Size".to_string(), self.payload_size.to_string())])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    const INTERFACE: &str = "ce48969398f05f33946d560708be108a";
    const AFU: &str = "d8424dc4a4a3c413f89e433683f9040b";

    pub(crate) fn gbs_with_header(guid1: u64, guid2: u64, metadata: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&guid1.to_le_bytes());
        data.extend_from_slice(&guid2.to_le_bytes());
        data.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
        data.extend_from_slice(metadata);
        data.extend_from_slice(payload);
        data
    }

    /// Assembles a GBS image with one accelerator cluster per AFU UUID.
    pub(crate) fn gbs_bytes(interface_uuid: &str, afu_uuids: &[&str], payload: &[u8]) -> Vec<u8> {
        let clusters: Vec<_> = afu_uuids
            .iter()
            .map(|afu| {
                serde_json::json!({
                    "accelerator-type-uuid": afu,
                    "name": "nlb_0",
                    "total-contexts": 1,
                })
            })
            .collect();
        let metadata = serde_json::json!({
            "version": 1,
            "platform-name": "DCP",
            "afu-image": {
                "magic-no": 488605312,
                "interface-uuid": interface_uuid,
                "power": 0,
                "clock-frequency-high": 312.5,
                "accelerator-clusters": clusters,
            },
        });
        let metadata = serde_json::to_vec(&metadata).expect("should serialize metadata");
        gbs_with_header(GBS_GUID1, GBS_GUID2, &metadata, payload)
    }

    #[test]
    fn test_parse_gbs() {
        let gbs = Gbs::from_bytes(gbs_bytes(
            "CE489693-98F0-5F33-946D-560708BE108A",
            &["d8424dc4-a4a3-c413-f89e-433683f9040b"],
            b"0123456789",
        ))
        .expect("should parse");

        assert_eq!(gbs.header.guid1, GBS_GUID1);
        assert_eq!(gbs.metadata.platform_name, "DCP");
        assert_eq!(gbs.interface_uuid(), INTERFACE);
        assert_eq!(gbs.accelerator_type_uuid(), AFU);
        assert_eq!(gbs.unique_uuid(), AFU);
        assert_eq!(gbs.payload_size(), 10);
        assert_eq!(gbs.raw_data().expect("should read payload"), b"0123456789");
        assert_eq!(
            gbs.extra_metadata(),
            BTreeMap::from([("Size".to_string(), "10".to_string())])
        );
        assert_eq!(
            gbs.install_path(Path::new("/srv")),
            Some(PathBuf::from(format!("/srv/{INTERFACE}/{AFU}.gbs")))
        );
    }

    #[test]
    fn test_open_is_repeatable() {
        let dir = TempDir::new().expect("should create temp dir");
        let path = dir.path().join("nlb.gbs");
        fs::write(&path, gbs_bytes(INTERFACE, &[AFU], b"payload")).expect("should write");

        let first = Gbs::open(&path).expect("should open");
        let second = Gbs::open(&path).expect("should open again");
        assert_eq!(first.header, second.header);
        assert_eq!(first.metadata, second.metadata);
        assert_eq!(first.interface_uuid(), second.interface_uuid());
        assert_eq!(
            first.raw_data().expect("should read"),
            second.raw_data().expect("should read")
        );
    }

    #[test]
    fn test_payload_readers_are_independent() {
        let gbs = Gbs::from_bytes(gbs_bytes(INTERFACE, &[AFU], b"abcdefgh")).expect("should parse");

        let mut first = gbs.raw_reader().expect("reader");
        let mut second = gbs.raw_reader().expect("reader");

        let mut buf = [0u8; 3];
        first.read_exact(&mut buf).expect("should read");
        assert_eq!(&buf, b"abc");

        second.seek(SeekFrom::End(-2)).expect("should seek");
        let mut tail = Vec::new();
        second.read_to_end(&mut tail).expect("should read");
        assert_eq!(tail, b"gh");

        first.read_exact(&mut buf).expect("should read");
        assert_eq!(&buf, b"def");
    }

    #[test]
    fn test_payload_from_file() {
        let dir = TempDir::new().expect("should create temp dir");
        let path = dir.path().join("nlb.gbs");
        fs::write(&path, gbs_bytes(INTERFACE, &[AFU], b"file-payload")).expect("should write");

        let gbs = Gbs::open(&path).expect("should open");
        let mut reader = gbs.raw_reader().expect("reader");
        reader.seek(SeekFrom::Start(5)).expect("should seek");
        let mut rest = String::new();
        reader.read_to_string(&mut rest).expect("should read");
        assert_eq!(rest, "payload");
    }

    #[test]
    fn test_wrong_magic() {
        let data = gbs_with_header(0xdead_beef, GBS_GUID2, b"{}", b"");
        let err = Gbs::from_bytes(data).expect_err("should reject magic");
        assert!(matches!(
            err.current_context(),
            BitstreamError::WrongMagic { guid1: 0xdead_beef, .. }
        ));
        assert!(err.to_string().contains("wrong magic"));
    }

    #[test]
    fn test_two_clusters() {
        let err = Gbs::from_bytes(gbs_bytes(INTERFACE, &[AFU, AFU], b""))
            .expect_err("should reject cluster count");
        assert!(matches!(
            err.current_context(),
            BitstreamError::ClusterCount { count: 2 }
        ));
        assert!(err.to_string().contains("incorrect length"));
    }

    #[test]
    fn test_metadata_length_bounds() {
        let empty = gbs_with_header(GBS_GUID1, GBS_GUID2, b"", b"payload");
        assert!(matches!(
            Gbs::from_bytes(empty).expect_err("zero length").current_context(),
            BitstreamError::MetadataLength { length: 0 }
        ));

        let big = gbs_with_header(GBS_GUID1, GBS_GUID2, &vec![b' '; 4096], b"");
        assert!(matches!(
            Gbs::from_bytes(big).expect_err("too long").current_context(),
            BitstreamError::MetadataLength { length: 4096 }
        ));
    }

    #[test]
    fn test_malformed_metadata() {
        let data = gbs_with_header(GBS_GUID1, GBS_GUID2, b"{\"afu-image\": [", b"");
        assert!(matches!(
            Gbs::from_bytes(data).expect_err("bad json").current_context(),
            BitstreamError::Metadata
        ));
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            Gbs::from_bytes(vec![0u8; 7]).expect_err("short").current_context(),
            BitstreamError::Header
        ));
    }
}
