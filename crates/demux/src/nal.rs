//! NAL unit helpers: length-prefixed (AVCC/HVCC) to Annex-B conversion and
//! parameter-set extraction from codec configuration records.

/// Annex-B start code (4 bytes).
pub const ANNEXB_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Parameter sets and NAL length size from an `avcC` or `hvcC` record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    /// Byte size of each NAL length prefix in samples (1, 2, or 4).
    pub length_size: u8,
    /// VPS/SPS/PPS NAL units in the order they must be fed to a decoder.
    pub units: Vec<Vec<u8>>,
    /// `avc1.PPCCLL` style profile/level string, when derivable.
    pub codec_string: Option<String>,
}

/// Parse an AVC decoder configuration record.
pub fn parse_avcc(record: &[u8]) -> Option<ParameterSets> {
    if record.len() < 7 || record[0] != 1 {
        return None;
    }
    let profile = record[1];
    let compat = record[2];
    let level = record[3];
    let length_size = (record[4] & 0x03) + 1;

    let mut units = Vec::new();
    let mut pos = 5;

    let sps_count = (record[pos] & 0x1F) as usize;
    pos += 1;
    for _ in 0..sps_count {
        let unit = read_sized_unit(record, &mut pos)?;
        units.push(unit);
    }

    let pps_count = *record.get(pos)? as usize;
    pos += 1;
    for _ in 0..pps_count {
        let unit = read_sized_unit(record, &mut pos)?;
        units.push(unit);
    }

    Some(ParameterSets {
        length_size,
        units,
        codec_string: Some(format!("avc1.{profile:02x}{compat:02x}{level:02x}")),
    })
}

/// Parse an HEVC decoder configuration record.
pub fn parse_hvcc(record: &[u8]) -> Option<ParameterSets> {
    if record.len() < 23 {
        return None;
    }
    let length_size = (record[21] & 0x03) + 1;
    let array_count = record[22] as usize;

    let mut units = Vec::new();
    let mut pos = 23;
    for _ in 0..array_count {
        // array_completeness(1) reserved(1) nal_unit_type(6)
        pos += 1;
        let nal_count = read_u16(record, &mut pos)? as usize;
        for _ in 0..nal_count {
            units.push(read_sized_unit(record, &mut pos)?);
        }
    }

    Some(ParameterSets {
        length_size,
        units,
        codec_string: None,
    })
}

/// Convert length-prefixed NAL units to Annex-B format.
///
/// Length-prefixed: `[length_size bytes length][NAL data]...`
/// Annex-B: `[0x00 0x00 0x00 0x01][NAL data]...`
///
/// A truncated trailing unit is dropped.
pub fn length_prefixed_to_annexb(data: &[u8], length_size: u8) -> Vec<u8> {
    let mut output = Vec::with_capacity(data.len() + 64);
    let ls = length_size as usize;
    let mut offset = 0;

    while offset + ls <= data.len() {
        let nal_len = read_nal_length(&data[offset..], ls);
        offset += ls;

        if offset + nal_len > data.len() {
            break;
        }

        output.extend_from_slice(&ANNEXB_START_CODE);
        output.extend_from_slice(&data[offset..offset + nal_len]);
        offset += nal_len;
    }

    output
}

/// Prepend parameter sets (as Annex-B units) to an Annex-B keyframe.
pub fn prepend_parameter_sets(units: &[Vec<u8>], frame: &[u8]) -> Vec<u8> {
    let extra: usize = units.iter().map(|u| u.len() + ANNEXB_START_CODE.len()).sum();
    let mut output = Vec::with_capacity(extra + frame.len());
    for unit in units {
        output.extend_from_slice(&ANNEXB_START_CODE);
        output.extend_from_slice(unit);
    }
    output.extend_from_slice(frame);
    output
}

fn read_nal_length(data: &[u8], length_size: usize) -> usize {
    data[..length_size]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize)
}

fn read_u16(data: &[u8], pos: &mut usize) -> Option<u16> {
    let bytes = data.get(*pos..*pos + 2)?;
    *pos += 2;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_sized_unit(data: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let len = read_u16(data, pos)? as usize;
    let unit = data.get(*pos..*pos + len)?.to_vec();
    *pos += len;
    Some(unit)
}
