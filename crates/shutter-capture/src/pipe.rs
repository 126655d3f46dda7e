// crates/shutter-capture/src/pipe.rs
//
// External-codec encoder sink: spawn the codec CLI with its stdin
// redirected to a pipe and stream uncompressed frames into it.
//
// Pipe writes are slow and wildly inconsistent (hundreds of microseconds
// to several milliseconds for the same payload), so the capture thread
// never writes directly. A pool of pre-allocated frame buffers cycles
// between two SPSC queues: readback fills a free buffer and queues it for
// writing; the writer thread sends it down the pipe and returns it to the
// free queue. Two counting semaphores carry the flow control: `write_sem`
// counts queued frames, `read_sem` counts free buffers.
//
// Shutdown is a sentinel, never a kill: acquire one free slot so the
// sentinel always fits, queue it, join the writer, drop our pipe end (the
// codec sees EOF and finishes the file), then wait for the process.
//
// Audio for this variant goes to a sibling .wav next to the movie file;
// multiplexing PCM into the same stdin stream as the video is not worth
// the trouble.

use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use shutter_core::movie::{MovieParams, WaveSample};
use shutter_core::plan::ConversionPlan;
use shutter_core::queue::{AsyncStream, Semaphore};

use crate::readback::ReadbackPipeline;
use crate::render::{RenderBackend, TexHandle};
use crate::sink::EncoderSink;
use crate::wav::WavSink;

/// Completed frame buffers kept in flight toward the codec process.
pub const MAX_BUFFERED_SEND_BUFS: usize = 8;

enum PipeMsg {
    Frame(Box<[u8]>),
    Stop,
}

pub struct PipeEncoderSink {
    child: Option<Child>,
    writer: Option<JoinHandle<()>>,
    write_queue: Arc<AsyncStream<PipeMsg>>,
    read_queue: Arc<AsyncStream<Box<[u8]>>>,
    write_sem: Arc<Semaphore>,
    read_sem: Arc<Semaphore>,
    readback: Option<ReadbackPipeline>,
    wav: Option<WavSink>,
    /// Buffer reserved by `begin_frame`, waiting for its frame.
    pending: Option<Box<[u8]>>,
}

impl PipeEncoderSink {
    /// Allocate the readback path and buffer pool, spawn the codec process
    /// and the writer thread. The codec binary is expected in the resource
    /// root, which is also the working directory, so the destination path
    /// may be relative to it.
    pub fn start(
        backend: &mut dyn RenderBackend,
        params: &MovieParams,
        resource_root: &Path,
    ) -> Result<Self> {
        let readback = ReadbackPipeline::start(backend, params)?;
        let frame_size = readback.plan().total_size();

        let wav = if params.audio_enabled {
            let wav_path = params.dest_file.with_extension("wav");
            match WavSink::begin(&wav_path, &params.audio) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    readback.stop(backend);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let args = build_codec_args(params, readback.plan());
        log::info!(
            "starting codec process for {} ({} bytes/frame)",
            params.dest_file.display(),
            frame_size
        );

        let spawned = Command::new(resource_root.join("ffmpeg"))
            .args(&args)
            .current_dir(resource_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                // Unwind the partial setup before reporting.
                readback.stop(backend);
                return Err(anyhow::anyhow!(e).context("spawn codec process"));
            }
        };

        let mut stdin = child
            .stdin
            .take()
            .expect("stdin was requested piped");

        // Known state before the writer exists: every buffer free.
        let write_queue = Arc::new(AsyncStream::with_capacity(MAX_BUFFERED_SEND_BUFS));
        let read_queue = Arc::new(AsyncStream::with_capacity(MAX_BUFFERED_SEND_BUFS));
        let write_sem = Arc::new(Semaphore::new(0, MAX_BUFFERED_SEND_BUFS as u32));
        let read_sem = Arc::new(Semaphore::new(
            MAX_BUFFERED_SEND_BUFS as u32,
            MAX_BUFFERED_SEND_BUFS as u32,
        ));
        for _ in 0..MAX_BUFFERED_SEND_BUFS {
            read_queue.push(vec![0u8; frame_size].into_boxed_slice());
        }

        let writer = {
            let write_queue = Arc::clone(&write_queue);
            let read_queue = Arc::clone(&read_queue);
            let write_sem = Arc::clone(&write_sem);
            let read_sem = Arc::clone(&read_sem);

            std::thread::Builder::new()
                .name("codec-pipe-writer".into())
                .spawn(move || loop {
                    write_sem.acquire();
                    let msg = write_queue.pull().expect("write semaphore counted a frame");
                    match msg {
                        PipeMsg::Frame(buf) => {
                            // Blocks until the remote end has consumed the
                            // bytes; that latency is why this thread exists.
                            if let Err(e) = stdin.write_all(&buf) {
                                log::error!("codec pipe write failed: {e}");
                            }
                            read_queue.push(buf);
                            read_sem.release();
                        }
                        PipeMsg::Stop => return,
                    }
                })
                .context("spawn pipe writer thread")?
        };

        Ok(Self {
            child: Some(child),
            writer: Some(writer),
            write_queue,
            read_queue,
            write_sem,
            read_sem,
            readback: Some(readback),
            wav,
            pending: None,
        })
    }
}

impl EncoderSink for PipeEncoderSink {
    fn begin_frame(&mut self) -> Result<()> {
        if self.pending.is_none() {
            self.read_sem.acquire();
            let buf = self.read_queue.pull().expect("read semaphore counted a buffer");
            self.pending = Some(buf);
        }
        Ok(())
    }

    fn push_frame(&mut self, backend: &mut dyn RenderBackend, frame: TexHandle) -> Result<()> {
        self.begin_frame()?;
        let mut buf = self.pending.take().expect("begin_frame reserved a buffer");

        let readback = self
            .readback
            .as_mut()
            .expect("sink used after end");
        let download = readback.convert_and_download(backend, frame, &mut buf);

        match download {
            Ok(()) => {
                self.write_queue.push(PipeMsg::Frame(buf));
                self.write_sem.release();
                Ok(())
            }
            Err(e) => {
                // The buffer stays ours; return it so the pool stays whole.
                self.read_queue.push(buf);
                self.read_sem.release();
                Err(e)
            }
        }
    }

    fn push_audio(&mut self, samples: &[WaveSample]) -> Result<()> {
        match &mut self.wav {
            Some(wav) => wav.push(samples),
            None => Ok(()),
        }
    }

    fn end(&mut self, backend: &mut dyn RenderBackend) -> Result<()> {
        // A reserved but unused buffer would leave the pool one short.
        if let Some(buf) = self.pending.take() {
            self.read_queue.push(buf);
            self.read_sem.release();
        }

        if let Some(writer) = self.writer.take() {
            // One free slot guarantees the sentinel fits in the queue.
            self.read_sem.acquire();
            self.write_queue.push(PipeMsg::Stop);
            self.write_sem.release();
            writer
                .join()
                .map_err(|_| anyhow::anyhow!("pipe writer thread panicked"))?;
        }

        // The writer owned our pipe end; with it gone the codec sees EOF
        // and finishes the container.
        if let Some(mut child) = self.child.take() {
            let status = child.wait().context("wait for codec process")?;
            if !status.success() {
                log::warn!("codec process exited with {status}");
            }
        }

        if let Some(wav) = self.wav.take() {
            wav.end()?;
        }
        if let Some(readback) = self.readback.take() {
            readback.stop(backend);
        }
        Ok(())
    }
}

/// Argument list for the codec CLI: rawvideo in on stdin, the profile's
/// encoder and quality knobs out.
fn build_codec_args(params: &MovieParams, plan: &ConversionPlan) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "quiet".into(),
        // Input: uncompressed frames from stdin.
        "-f".into(),
        "rawvideo".into(),
        "-vcodec".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        plan.pix_fmt_text().into(),
        "-s".into(),
        format!("{}x{}", params.width, params.height),
        "-r".into(),
        params.fps.to_string(),
        "-y".into(),
        "-i".into(),
        "-".into(),
        // Output.
        "-threads".into(),
        "0".into(),
        "-vcodec".into(),
        params.encoder.clone(),
    ];

    if let Some(space) = plan.color_space_text() {
        args.push("-colorspace".into());
        args.push(space.into());
    }

    args.push("-framerate".into());
    args.push(params.fps.to_string());
    args.push("-crf".into());
    args.push(params.x264_crf.to_string());
    args.push("-preset".into());
    args.push(params.x264_preset.clone());

    if params.x264_intra {
        args.push("-x264-params".into());
        args.push("keyint=1".into());
    }

    args.push(params.dest_file.to_string_lossy().into_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use shutter_core::movie::{AudioParams, ColorSpace, PixelFormat, VideoFormat};

    fn params() -> MovieParams {
        MovieParams {
            width: 1280,
            height: 720,
            fps: 60,
            mosample_mult: 1,
            mosample_exposure: 1.0,
            format: VideoFormat::new(PixelFormat::Nv12, ColorSpace::Bt601),
            encoder: "libx264".into(),
            x264_crf: 18,
            x264_preset: "veryfast".into(),
            x264_intra: false,
            dnxhr_profile: String::new(),
            audio_enabled: false,
            audio_encoder: String::new(),
            audio: AudioParams::default(),
            dest_file: "movies/run.mp4".into(),
        }
    }

    #[test]
    fn codec_args_cover_input_and_output() {
        let p = params();
        let plan = ConversionPlan::new(p.format, p.width, p.height);
        let args = build_codec_args(&p, &plan);

        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo"));
        assert!(joined.contains("-pix_fmt nv12"));
        assert!(joined.contains("-s 1280x720"));
        assert!(joined.contains("-r 60"));
        assert!(joined.contains("-y -i -"));
        assert!(joined.contains("-vcodec libx264"));
        assert!(joined.contains("-colorspace bt470bg"));
        assert!(joined.contains("-crf 18"));
        assert!(joined.contains("-preset veryfast"));
        assert!(!joined.contains("keyint"));
        assert_eq!(args.last().unwrap(), "movies/run.mp4");
    }

    #[test]
    fn intra_adds_keyint_and_rgb_drops_colorspace() {
        let mut p = params();
        p.x264_intra = true;
        p.encoder = "libx264rgb".into();
        p.format = VideoFormat::new(PixelFormat::Bgr0, ColorSpace::Bt601);
        let plan = ConversionPlan::new(p.format, p.width, p.height);
        let args = build_codec_args(&p, &plan);

        let joined = args.join(" ");
        assert!(joined.contains("-pix_fmt bgr0"));
        assert!(!joined.contains("-colorspace"));
        assert!(joined.contains("-x264-params keyint=1"));
    }
}
