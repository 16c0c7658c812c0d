use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{
    AudioCodec, AudioParams, Container, TaskId, TaskRequest, TranscodingParams, VideoCodec,
    VideoParams,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MasterConfig;
use crate::error::{Result, TaskError};

/// Cota de los timeouts por request (10 años).
pub const MAX_TIMEOUT_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Definición validada y normalizada de una tarea de transcodificación.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: TaskId,
    pub name: String,
    /// Único archivo de entrada
    pub input: PathBuf,
    /// Chunks pedidos; el splitter puede devolver menos
    pub requested_chunks: usize,
    pub subtask_timeout_secs: u64,
    /// Deadline de la tarea completa
    pub deadline: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub params: TranscodingParams,
    /// Ruta final del resultado mezclado
    pub output_file: PathBuf,
}

/// Valida la configuración cruda del usuario y arma una `TaskDefinition`.
/// No toca el filesystem salvo para confirmar que existe la entrada.
pub struct TaskDefinitionBuilder<'a> {
    config: &'a MasterConfig,
}

/// Valores por defecto derivados del archivo de entrada.
struct Presets {
    container: Container,
}

impl<'a> TaskDefinitionBuilder<'a> {
    pub fn new(config: &'a MasterConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, req: &TaskRequest) -> Result<TaskDefinition> {
        self.build_at(req, Utc::now())
    }

    pub fn build_at(&self, req: &TaskRequest, now: DateTime<Utc>) -> Result<TaskDefinition> {
        if req.name.trim().is_empty() {
            return Err(TaskError::MissingRequiredField("name"));
        }

        let input = match req.resources.as_slice() {
            [] => return Err(TaskError::MissingRequiredField("resources")),
            [only] if !only.trim().is_empty() => PathBuf::from(only),
            [_] => return Err(TaskError::MissingRequiredField("resources")),
            many => {
                return Err(TaskError::Configuration(format!(
                    "se esperaba un único archivo de entrada y llegaron {}",
                    many.len()
                )))
            }
        };

        let options = req
            .options
            .as_ref()
            .ok_or(TaskError::MissingRequiredField("options"))?;

        let output_dir = options
            .output_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or(TaskError::MissingRequiredField("options.output_path"))?;

        let presets = presets_for(&input)?;

        let container = match options.container.as_deref() {
            Some(name) => parse_name::<Container>(name)?,
            None => presets.container,
        };

        let audio = AudioParams {
            codec: options
                .audio
                .codec
                .as_deref()
                .map(parse_name::<AudioCodec>)
                .transpose()?,
            bitrate: options.audio.bit_rate.clone(),
        };

        let video = VideoParams {
            codec: options
                .video
                .codec
                .as_deref()
                .map(parse_name::<VideoCodec>)
                .transpose()?,
            bitrate: options.video.bit_rate.clone(),
            frame_rate: options.video.frame_rate.clone(),
            resolution: options.video.resolution,
        };

        assert_codec_container_support(audio.codec, video.codec, container)?;

        let requested_chunks = req.subtasks_count.unwrap_or(1) as usize;
        if requested_chunks == 0 {
            return Err(TaskError::Configuration(
                "subtasks_count debe ser mayor que cero".to_string(),
            ));
        }

        let output_file =
            output_path(&req.name, container, output_dir, options.output_filename.as_deref())?;

        let subtask_timeout_secs = req
            .subtask_timeout_secs
            .unwrap_or(self.config.subtask_timeout.as_secs());
        let task_timeout_secs = req
            .timeout_secs
            .unwrap_or(self.config.task_timeout.as_secs());

        check_timeout("subtask_timeout_secs", subtask_timeout_secs)?;
        check_timeout("timeout_secs", task_timeout_secs)?;
        let deadline = deadline_after(now, task_timeout_secs).ok_or_else(|| {
            TaskError::Configuration(format!("timeout_secs fuera de rango: {task_timeout_secs}"))
        })?;

        let definition = TaskDefinition {
            task_id: uuid::Uuid::new_v4().to_string(),
            name: req.name.clone(),
            input,
            requested_chunks,
            subtask_timeout_secs,
            deadline,
            submitted_at: now,
            params: TranscodingParams {
                video,
                audio,
                container,
                strip_unsupported_data_streams: options
                    .strip_unsupported_data_streams
                    .unwrap_or(false),
                strip_unsupported_subtitle_streams: options
                    .strip_unsupported_subtitle_streams
                    .unwrap_or(false),
            },
            output_file,
        };

        debug!(
            "definición de transcodificación armada: task_id={} output={}",
            definition.task_id,
            definition.output_file.display()
        );

        Ok(definition)
    }
}

/// Timeouts aceptados: 1s .. MAX_TIMEOUT_SECS
fn check_timeout(field: &str, secs: u64) -> Result<()> {
    if secs == 0 || secs > MAX_TIMEOUT_SECS {
        return Err(TaskError::Configuration(format!(
            "{field} debe estar entre 1 y {MAX_TIMEOUT_SECS} segundos (llegó {secs})"
        )));
    }
    Ok(())
}

/// `now + secs` sin pánico: None si no entra en un DateTime.
pub fn deadline_after(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    now.checked_add_signed(ChronoDuration::try_seconds(secs)?)
}

fn parse_name<T>(name: &str) -> Result<T>
where
    T: std::str::FromStr<Err = common::media::UnknownName>,
{
    name.parse::<T>()
        .map_err(|e| TaskError::Configuration(e.to_string()))
}

fn presets_for(input: &Path) -> Result<Presets> {
    if !input.is_file() {
        return Err(TaskError::Configuration(format!(
            "{} no existe",
            input.display()
        )));
    }

    let container = Container::from_extension(&input.to_string_lossy()).unwrap_or(Container::Mp4);
    Ok(Presets { container })
}

fn assert_codec_container_support(
    audio: Option<AudioCodec>,
    video: Option<VideoCodec>,
    container: Container,
) -> Result<()> {
    if let Some(codec) = audio {
        if !container.supports_audio(codec) {
            return Err(TaskError::UnsupportedCodecForContainer {
                codec: codec.to_string(),
                container,
            });
        }
    }

    if let Some(codec) = video {
        if !container.supports_video(codec) {
            return Err(TaskError::UnsupportedCodecForContainer {
                codec: codec.to_string(),
                container,
            });
        }
    }

    Ok(())
}

/// Ruta final determinista: <output_path>/<output_filename | name.container>.
/// Sin sufijos de timestamp.
pub fn output_path(
    name: &str,
    container: Container,
    output_dir: &str,
    explicit_filename: Option<&str>,
) -> Result<PathBuf> {
    let filename = match explicit_filename {
        Some(f) if !f.trim().is_empty() => f.to_string(),
        _ => format!("{}.{}", name, container),
    };
    if !is_plain_file_name(&filename) {
        return Err(TaskError::Configuration(format!(
            "nombre de archivo de salida inválido: {filename}"
        )));
    }
    Ok(Path::new(output_dir).join(filename))
}

/// Un único componente: sin separadores ni "..", para no salir de output_path.
fn is_plain_file_name(name: &str) -> bool {
    !name.contains(['/', '\\'])
        && matches!(
            Path::new(name).components().collect::<Vec<_>>().as_slice(),
            [Component::Normal(_)]
        )
}
