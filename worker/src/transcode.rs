use anyhow::{bail, Context, Result};
use chrono::Utc;
use common::{AudioCodec, DispatchDescriptor, Outcome, TranscodingParams, VideoCodec};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Nombre del encoder que espera ffmpeg para cada codec.
fn video_encoder(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "libx264",
        VideoCodec::H265 => "libx265",
        VideoCodec::Mpeg2 => "mpeg2video",
        VideoCodec::Mpeg4 => "mpeg4",
        VideoCodec::Vp8 => "libvpx",
        VideoCodec::Vp9 => "libvpx-vp9",
        VideoCodec::Av1 => "libaom-av1",
    }
}

fn audio_encoder(codec: AudioCodec) -> &'static str {
    match codec {
        AudioCodec::Aac => "aac",
        AudioCodec::Mp3 => "libmp3lame",
        AudioCodec::Ac3 => "ac3",
        AudioCodec::Opus => "libopus",
        AudioCodec::Vorbis => "libvorbis",
    }
}

/// Argumentos para el programa de transcodificación (estilo ffmpeg).
pub fn program_args(input: &Path, output: &Path, params: &TranscodingParams) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
    ];

    let video = &params.video;
    if let Some(codec) = video.codec {
        args.push("-c:v".into());
        args.push(video_encoder(codec).into());
    }
    if let Some(bitrate) = &video.bitrate {
        args.push("-b:v".into());
        args.push(bitrate.clone());
    }
    if let Some(fr) = &video.frame_rate {
        args.push("-r".into());
        args.push(fr.clone());
    }
    if let Some((w, h)) = video.resolution {
        args.push("-s".into());
        args.push(format!("{}x{}", w, h));
    }

    let audio = &params.audio;
    if let Some(codec) = audio.codec {
        args.push("-c:a".into());
        args.push(audio_encoder(codec).into());
    }
    if let Some(bitrate) = &audio.bitrate {
        args.push("-b:a".into());
        args.push(bitrate.clone());
    }

    args.push(output.to_string_lossy().to_string());
    args
}

/// Ruta del resultado: <output_dir>/<task>/chunk-<index>-<dispatch>.<ext>
pub fn result_path(output_dir: &Path, d: &DispatchDescriptor) -> PathBuf {
    output_dir.join(&d.task_id).join(format!(
        "chunk-{:04}-{}.{}",
        d.chunk_index, d.dispatch_id, d.params.container
    ))
}

async fn compute(d: &DispatchDescriptor, output: &Path, program: Option<&str>) -> Result<()> {
    let input = Path::new(&d.resource);
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("no se pudo crear {}", parent.display()))?;
    }

    match program {
        Some(program) => {
            let args = program_args(input, output, &d.params);
            debug!("ejecutando {} {:?}", program, args);

            let out = Command::new(program)
                .args(&args)
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("no se pudo lanzar {}", program))?;

            if !out.status.success() {
                bail!(
                    "{} terminó con {}: {}",
                    program,
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
            }
        }
        None => {
            // sin programa configurado el chunk se copia tal cual
            tokio::fs::copy(input, output)
                .await
                .with_context(|| format!("no se pudo copiar {}", input.display()))?;
        }
    }
    Ok(())
}

/// Ejecuta un dispatch acotado por su deadline y devuelve el resultado terminal.
pub async fn execute(
    d: &DispatchDescriptor,
    output_dir: &Path,
    program: Option<&str>,
) -> (Outcome, Vec<String>) {
    let remaining = (d.deadline - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    if remaining.is_zero() {
        warn!("dispatch {} llegó vencido", d.dispatch_id);
        return (Outcome::TimedOut, Vec::new());
    }

    let output = result_path(output_dir, d);
    match tokio::time::timeout(remaining, compute(d, &output, program)).await {
        Ok(Ok(())) => {
            info!(
                "chunk {} de la tarea {} listo en {}",
                d.chunk_index,
                d.task_id,
                output.display()
            );
            (Outcome::Succeeded, vec![output.to_string_lossy().to_string()])
        }
        Ok(Err(e)) => {
            warn!("error procesando el dispatch {}: {:#}", d.dispatch_id, e);
            (Outcome::Failed, Vec::new())
        }
        Err(_) => {
            warn!("dispatch {} excedió su deadline", d.dispatch_id);
            (Outcome::TimedOut, Vec::new())
        }
    }
}
