use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/* =========================
   Códecs y contenedores
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Mpeg2,
    Mpeg4,
    Vp8,
    Vp9,
    Av1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Mp3,
    Ac3,
    Opus,
    Vorbis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mov,
    Mkv,
    Webm,
    Avi,
}

impl VideoCodec {
    pub fn name(self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Mpeg2 => "mpeg2",
            VideoCodec::Mpeg4 => "mpeg4",
            VideoCodec::Vp8 => "vp8",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Av1 => "av1",
        }
    }
}

impl AudioCodec {
    pub fn name(self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Mp3 => "mp3",
            AudioCodec::Ac3 => "ac3",
            AudioCodec::Opus => "opus",
            AudioCodec::Vorbis => "vorbis",
        }
    }
}

impl Container {
    pub fn name(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mov => "mov",
            Container::Mkv => "mkv",
            Container::Webm => "webm",
            Container::Avi => "avi",
        }
    }

    /// Contenedor a partir de la extensión de un archivo ("clip.MKV" -> Mkv).
    pub fn from_extension(path: &str) -> Option<Container> {
        let ext = std::path::Path::new(path).extension()?.to_str()?;
        ext.to_ascii_lowercase().parse().ok()
    }

    pub fn supported_video_codecs(self) -> &'static [VideoCodec] {
        use VideoCodec::*;
        match self {
            Container::Mp4 | Container::Mov => &[H264, H265, Mpeg4],
            Container::Mkv => &[H264, H265, Mpeg2, Mpeg4, Vp8, Vp9, Av1],
            Container::Webm => &[Vp8, Vp9, Av1],
            Container::Avi => &[H264, Mpeg2, Mpeg4],
        }
    }

    pub fn supported_audio_codecs(self) -> &'static [AudioCodec] {
        use AudioCodec::*;
        match self {
            Container::Mp4 => &[Aac, Mp3, Ac3],
            Container::Mov => &[Aac, Mp3],
            Container::Mkv => &[Aac, Mp3, Ac3, Opus, Vorbis],
            Container::Webm => &[Opus, Vorbis],
            Container::Avi => &[Mp3, Ac3],
        }
    }

    pub fn supports_video(self, codec: VideoCodec) -> bool {
        self.supported_video_codecs().contains(&codec)
    }

    pub fn supports_audio(self, codec: AudioCodec) -> bool {
        self.supported_audio_codecs().contains(&codec)
    }
}

/// Error al interpretar un nombre de códec o contenedor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownName {
    pub kind: &'static str,
    pub name: String,
}

impl fmt::Display for UnknownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} desconocido: {}", self.kind, self.name)
    }
}

impl std::error::Error for UnknownName {}

macro_rules! named_enum {
    ($ty:ty, $kind:literal, [$($variant:path),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = UnknownName;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_ascii_lowercase();
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.name() == wanted)
                    .ok_or_else(|| UnknownName {
                        kind: $kind,
                        name: s.to_string(),
                    })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

named_enum!(
    VideoCodec,
    "códec de video",
    [
        VideoCodec::H264,
        VideoCodec::H265,
        VideoCodec::Mpeg2,
        VideoCodec::Mpeg4,
        VideoCodec::Vp8,
        VideoCodec::Vp9,
        VideoCodec::Av1,
    ]
);
named_enum!(
    AudioCodec,
    "códec de audio",
    [
        AudioCodec::Aac,
        AudioCodec::Mp3,
        AudioCodec::Ac3,
        AudioCodec::Opus,
        AudioCodec::Vorbis,
    ]
);
named_enum!(
    Container,
    "contenedor",
    [
        Container::Mp4,
        Container::Mov,
        Container::Mkv,
        Container::Webm,
        Container::Avi,
    ]
);

/* =========================
   Parámetros de transcodificación
   ========================= */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoParams {
    pub codec: Option<VideoCodec>,
    /// Ej: "2M"
    pub bitrate: Option<String>,
    /// Ej: "30" o "30000/1001"
    pub frame_rate: Option<String>,
    /// (ancho, alto)
    pub resolution: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioParams {
    pub codec: Option<AudioCodec>,
    pub bitrate: Option<String>,
}

/// Parámetros de cómputo que viajan opacos del scheduler al worker.
/// Son idénticos para todos los chunks de una tarea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodingParams {
    pub video: VideoParams,
    pub audio: AudioParams,
    pub container: Container,
    #[serde(default)]
    pub strip_unsupported_data_streams: bool,
    #[serde(default)]
    pub strip_unsupported_subtitle_streams: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsea_nombres_sin_importar_mayusculas() {
        assert_eq!("H264".parse::<VideoCodec>(), Ok(VideoCodec::H264));
        assert_eq!(" opus ".parse::<AudioCodec>(), Ok(AudioCodec::Opus));
        assert_eq!("WebM".parse::<Container>(), Ok(Container::Webm));

        let err = "divx".parse::<VideoCodec>().unwrap_err();
        assert_eq!(err.name, "divx");
    }

    #[test]
    fn contenedor_desde_extension() {
        assert_eq!(Container::from_extension("/data/in/clip.MKV"), Some(Container::Mkv));
        assert_eq!(Container::from_extension("clip.mp4"), Some(Container::Mp4));
        assert_eq!(Container::from_extension("clip.xyz"), None);
        assert_eq!(Container::from_extension("sin_extension"), None);
    }

    #[test]
    fn webm_no_soporta_h264_ni_aac() {
        assert!(!Container::Webm.supports_video(VideoCodec::H264));
        assert!(!Container::Webm.supports_audio(AudioCodec::Aac));
        assert!(Container::Webm.supports_video(VideoCodec::Vp9));
        assert!(Container::Mp4.supports_audio(AudioCodec::Aac));
    }
}
