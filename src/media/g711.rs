//! G.711 Codec (PCMU / PCMA)
//!
//! Klassische Telefon-Codecs mit 8 kHz. Kodiert das Mikrofon für den
//! lokalen Track und dekodiert empfangene RTP Payloads für die Wiedergabe.

/// Abtastrate beider G.711 Varianten
pub const G711_SAMPLE_RATE: u32 = 8000;

const ULAW_BIAS: i32 = 0x84;

const ULAW_CLIP: i32 = 32635;

/// Segment-Obergrenzen für A-law (13 Bit)
const ALAW_SEGMENT_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

/// Unterstützte Payload-Formate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711 {
    /// μ-law (Nordamerika, Japan)
    Pcmu,
    /// A-law (Europa)
    Pcma,
}

impl G711 {
    /// Erkennt den Codec am MIME Type (`audio/PCMU`, `audio/PCMA`)
    pub fn from_mime(mime: &str) -> Option<Self> {
        let subtype = mime.rsplit('/').next().unwrap_or(mime);
        if subtype.eq_ignore_ascii_case("pcmu") {
            Some(Self::Pcmu)
        } else if subtype.eq_ignore_ascii_case("pcma") {
            Some(Self::Pcma)
        } else {
            None
        }
    }

    /// MIME Type für SDP und Tracks
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Pcmu => "audio/PCMU",
            Self::Pcma => "audio/PCMA",
        }
    }

    /// Statischer RTP Payload Type
    pub fn payload_type(&self) -> u8 {
        match self {
            Self::Pcmu => 0,
            Self::Pcma => 8,
        }
    }

    /// Kodiert normalisierte f32 Samples (ein Byte pro Sample)
    pub fn encode(&self, samples: &[f32]) -> Vec<u8> {
        let from_linear = match self {
            Self::Pcmu => linear_to_ulaw,
            Self::Pcma => linear_to_alaw,
        };
        samples
            .iter()
            .map(|&s| from_linear((s.clamp(-1.0, 1.0) * 32767.0) as i16))
            .collect()
    }

    /// Dekodiert einen Payload zu normalisierten f32 Samples
    pub fn decode(&self, payload: &[u8]) -> Vec<f32> {
        let to_linear = match self {
            Self::Pcmu => ulaw_to_linear,
            Self::Pcma => alaw_to_linear,
        };
        payload
            .iter()
            .map(|&b| to_linear(b) as f32 / 32768.0)
            .collect()
    }
}

fn ulaw_to_linear(ulaw: u8) -> i16 {
    let ulaw = !ulaw;
    let exponent = ((ulaw >> 4) & 0x07) as i32;
    let mantissa = (ulaw & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if ulaw & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 3;
    let mask = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let Some(segment) = ALAW_SEGMENT_END.iter().position(|&end| pcm <= end) else {
        return 0x7F ^ mask;
    };
    let mantissa = if segment < 2 {
        (pcm >> 1) & 0x0F
    } else {
        (pcm >> segment) & 0x0F
    };

    ((segment as i32) << 4 | mantissa) as u8 ^ mask
}

fn alaw_to_linear(alaw: u8) -> i16 {
    let alaw = alaw ^ 0x55;
    let exponent = ((alaw >> 4) & 0x07) as i32;
    let mantissa = (alaw & 0x0F) as i32;

    let magnitude = if exponent > 0 {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    } else {
        (mantissa << 4) + 0x08
    };

    // A-law: gesetztes Vorzeichenbit = positiv
    if alaw & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}
