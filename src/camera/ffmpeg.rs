use super::{Camera, CameraEvent, OutputTarget, PreviewFrame};
use crate::config::CameraConfig;
use crate::error::CameraError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_POLL: Duration = Duration::from_millis(250);
const SEGMENT_LIST: &str = ".segments.list";

struct Running {
    child: Child,
    stdin: Option<ChildStdin>,
    stopping: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    /// Segment list of the muxer and how many entries were already reported
    list: Option<(PathBuf, PathBuf, Arc<AtomicUsize>)>,
}

/// V4L2 capture through an external ffmpeg process
pub struct FfmpegCamera {
    config: CameraConfig,
    preview: Arc<watch::Sender<Option<PreviewFrame>>>,
    preview_fps: Option<u32>,
    /// Preview frame numbers keep counting across ffmpeg restarts
    preview_seq: Arc<AtomicU64>,
    events: Option<mpsc::Sender<CameraEvent>>,
    running: Option<Running>,
}

fn encoder_for(codec: &str) -> &str {
    match codec {
        "h264" => "libx264",
        "h265" | "hevc" => "libx265",
        other => other,
    }
}

/// Full ffmpeg argument list for one output target
pub fn build_args(
    config: &CameraConfig,
    target: &OutputTarget,
    preview_fps: Option<u32>,
    segment_list: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "v4l2".into(),
        "-framerate".into(),
        config.fps.to_string(),
        "-video_size".into(),
        format!("{}x{}", config.width, config.height),
        "-i".into(),
        config.device.display().to_string(),
        "-map".into(),
        "0:v".into(),
        "-c:v".into(),
        encoder_for(&config.codec).to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ];

    match target {
        OutputTarget::File { path, max_duration } => {
            args.extend([
                "-t".into(),
                format!("{:.3}", max_duration.as_secs_f64()),
                "-y".into(),
                path.display().to_string(),
            ]);
        }
        OutputTarget::Segments {
            dir,
            pattern,
            segment_len,
            first_index,
        } => {
            let secs = segment_len.as_secs_f64();
            args.extend([
                "-force_key_frames".into(),
                format!("expr:gte(t,n_forced*{})", secs),
                "-f".into(),
                "segment".into(),
                "-segment_time".into(),
                secs.to_string(),
                "-reset_timestamps".into(),
                "1".into(),
                "-segment_start_number".into(),
                first_index.to_string(),
                "-segment_list".into(),
                segment_list.display().to_string(),
                "-segment_list_type".into(),
                "flat".into(),
                "-segment_list_flags".into(),
                "+live".into(),
                "-y".into(),
                dir.join(pattern).display().to_string(),
            ]);
        }
    }

    if let Some(fps) = preview_fps {
        args.extend([
            "-map".into(),
            "0:v".into(),
            "-vf".into(),
            format!(
                "fps={},scale={}:{}",
                fps, config.preview_width, config.preview_height
            ),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "pipe:1".into(),
        ]);
    }

    args
}

/// Publish raw rgb24 frames from `src` until it ends
async fn read_preview_frames<R: AsyncRead + Unpin>(
    mut src: R,
    (width, height): (u32, u32),
    preview: &watch::Sender<Option<PreviewFrame>>,
    seq: &AtomicU64,
) {
    let len = PreviewFrame::byte_len(width, height);
    loop {
        let mut buf = vec![0u8; len];
        if src.read_exact(&mut buf).await.is_err() {
            break;
        }
        preview.send_replace(Some(PreviewFrame {
            seq: seq.fetch_add(1, Ordering::Relaxed) + 1,
            width,
            height,
            rgb: Arc::from(buf),
        }));
    }
}

impl FfmpegCamera {
    pub fn new(
        config: CameraConfig,
        preview: watch::Sender<Option<PreviewFrame>>,
        preview_fps: Option<u32>,
    ) -> Self {
        Self {
            config,
            preview: Arc::new(preview),
            preview_fps,
            preview_seq: Arc::new(AtomicU64::new(0)),
            events: None,
            running: None,
        }
    }

    fn spawn_stderr_watch(
        &self,
        stderr: tokio::process::ChildStderr,
        stopping: Arc<AtomicBool>,
        cap: Option<Duration>,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        let started = Instant::now();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut last = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("ffmpeg: {}", line);
                last = line;
            }

            // Reaching the -t cap is a normal end
            let expired = cap.is_some_and(|cap| started.elapsed() >= cap);
            if stopping.load(Ordering::SeqCst) || expired {
                return;
            }
            if let Some(events) = events {
                let reason = if last.is_empty() {
                    "ffmpeg exited unexpectedly".to_string()
                } else {
                    last
                };
                let _ = events.send(CameraEvent::Failed { reason }).await;
            }
        })
    }

    fn spawn_preview_reader(&self, stdout: ChildStdout) -> JoinHandle<()> {
        let preview = self.preview.clone();
        let seq = self.preview_seq.clone();
        let size = (self.config.preview_width, self.config.preview_height);

        tokio::spawn(async move {
            read_preview_frames(stdout, size, &preview, &seq).await;
            preview.send_replace(None);
        })
    }

    fn spawn_list_watch(&self, list: PathBuf, dir: PathBuf, seen: Arc<AtomicUsize>) -> JoinHandle<()> {
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIST_POLL);
            loop {
                ticker.tick().await;
                for path in read_new_entries(&list, &dir, &seen).await {
                    if let Some(events) = &events {
                        if events.send(CameraEvent::SegmentClosed { path }).await.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Entries appended to the muxer's segment list since the last call
async fn read_new_entries(list: &Path, dir: &Path, seen: &AtomicUsize) -> Vec<PathBuf> {
    let Ok(contents) = tokio::fs::read_to_string(list).await else {
        return Vec::new();
    };
    // Only complete lines; the muxer may be mid-write
    let complete: Vec<&str> = contents
        .split_inclusive('\n')
        .filter(|l| l.ends_with('\n'))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let already = seen.load(Ordering::SeqCst);
    if complete.len() <= already {
        return Vec::new();
    }
    seen.store(complete.len(), Ordering::SeqCst);
    complete[already..].iter().map(|name| dir.join(name)).collect()
}

#[async_trait]
impl Camera for FfmpegCamera {
    fn is_open(&self) -> bool {
        self.events.is_some()
    }

    async fn open(&mut self, events: mpsc::Sender<CameraEvent>) -> Result<(), CameraError> {
        which::which(&self.config.ffmpeg_path).map_err(|e| {
            CameraError::Unavailable(format!("{} not found: {}", self.config.ffmpeg_path, e))
        })?;

        if tokio::fs::metadata(&self.config.device).await.is_err() {
            return Err(CameraError::Unavailable(format!(
                "capture device {:?} not present",
                self.config.device
            )));
        }

        self.events = Some(events);
        tracing::info!(
            "Camera opened ({:?}, {}x{}@{})",
            self.config.device,
            self.config.width,
            self.config.height,
            self.config.fps
        );
        Ok(())
    }

    async fn start_output(&mut self, target: OutputTarget) -> Result<(), CameraError> {
        if self.events.is_none() {
            return Err(CameraError::Unavailable("camera is not open".to_string()));
        }
        if self.running.is_some() {
            self.stop_output().await?;
        }

        let (list, cap) = match &target {
            OutputTarget::File { max_duration, .. } => (None, Some(*max_duration)),
            OutputTarget::Segments { dir, .. } => {
                let list = dir.join(SEGMENT_LIST);
                let _ = tokio::fs::remove_file(&list).await;
                (Some((list, dir.clone())), None)
            }
        };
        let list_path = list
            .as_ref()
            .map(|(l, _)| l.clone())
            .unwrap_or_else(|| PathBuf::from(SEGMENT_LIST));

        let args = build_args(&self.config, &target, self.preview_fps, &list_path);
        tracing::debug!("Spawning {} {}", self.config.ffmpeg_path, args.join(" "));

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(if self.preview_fps.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CameraError::Unavailable(format!("failed to spawn ffmpeg: {}", e)))?;

        let stopping = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::new();

        if let Some(stderr) = child.stderr.take() {
            tasks.push(self.spawn_stderr_watch(stderr, stopping.clone(), cap));
        }
        if let Some(stdout) = child.stdout.take() {
            tasks.push(self.spawn_preview_reader(stdout));
        }
        let list = list.map(|(list, dir)| {
            let seen = Arc::new(AtomicUsize::new(0));
            tasks.push(self.spawn_list_watch(list.clone(), dir.clone(), seen.clone()));
            (list, dir, seen)
        });

        self.running = Some(Running {
            stdin: child.stdin.take(),
            child,
            stopping,
            tasks,
            list,
        });
        Ok(())
    }

    async fn stop_output(&mut self) -> Result<(), CameraError> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        running.stopping.store(true, Ordering::SeqCst);

        // 'q' asks ffmpeg to finish the container cleanly
        if let Some(mut stdin) = running.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }

        let status = match tokio::time::timeout(STOP_TIMEOUT, running.child.wait()).await {
            Ok(status) => status.map_err(|e| CameraError::Write(e.to_string()))?,
            Err(_) => {
                tracing::warn!("ffmpeg did not exit within {:?}, killing it", STOP_TIMEOUT);
                let _ = running.child.kill().await;
                for task in running.tasks {
                    task.abort();
                }
                return Err(CameraError::Write("ffmpeg had to be killed".to_string()));
            }
        };

        for task in running.tasks {
            task.abort();
        }
        self.preview.send_replace(None);

        // Report segments the list watcher had not picked up yet, including the last one
        if let Some((list, dir, seen)) = running.list {
            for path in read_new_entries(&list, &dir, &seen).await {
                if let Some(events) = &self.events {
                    if events.try_send(CameraEvent::SegmentClosed { path }).is_err() {
                        tracing::warn!("Camera event queue full, dropping segment notification");
                    }
                }
            }
            let _ = tokio::fs::remove_file(&list).await;
        }

        if !status.success() {
            return Err(CameraError::Write(format!("ffmpeg exited with {}", status)));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CameraError> {
        let result = self.stop_output().await;
        self.events = None;
        tracing::info!("Camera closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_target_is_capped() {
        let config = CameraConfig::default();
        let target = OutputTarget::File {
            path: PathBuf::from("/videos/a_00000.mp4"),
            max_duration: Duration::from_secs(30),
        };

        let args = build_args(&config, &target, None, Path::new("unused"));
        let joined = args.join(" ");

        assert!(joined.contains("-f v4l2"));
        assert!(joined.contains("-i /dev/video0"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.ends_with("-t 30.000 -y /videos/a_00000.mp4"));
        assert!(!joined.contains("pipe:1"));
    }

    #[test]
    fn test_segment_target_forces_keyframes_and_lists() {
        let config = CameraConfig::default();
        let target = OutputTarget::Segments {
            dir: PathBuf::from("/videos"),
            pattern: "20260101T000000000_%05d.mp4".to_string(),
            segment_len: Duration::from_secs(30),
            first_index: 3,
        };

        let args = build_args(&config, &target, Some(5), Path::new("/videos/.segments.list"));
        let joined = args.join(" ");

        assert!(joined.contains("-force_key_frames expr:gte(t,n_forced*30)"));
        assert!(joined.contains("-segment_time 30"));
        assert!(joined.contains("-segment_start_number 3"));
        assert!(joined.contains("-segment_list /videos/.segments.list"));
        assert!(joined.contains("/videos/20260101T000000000_%05d.mp4"));
        assert!(joined.ends_with("-vf fps=5,scale=160:90 -f rawvideo -pix_fmt rgb24 pipe:1"));
    }

    #[tokio::test]
    async fn test_segment_list_reports_only_new_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join(SEGMENT_LIST);
        let seen = AtomicUsize::new(0);

        std::fs::write(&list, "a_00000.mp4\na_00001.mp").unwrap();
        assert_eq!(
            read_new_entries(&list, dir.path(), &seen).await,
            vec![dir.path().join("a_00000.mp4")]
        );

        std::fs::write(&list, "a_00000.mp4\na_00001.mp4\n").unwrap();
        assert_eq!(
            read_new_entries(&list, dir.path(), &seen).await,
            vec![dir.path().join("a_00001.mp4")]
        );
        assert!(read_new_entries(&list, dir.path(), &seen).await.is_empty());
    }

    #[tokio::test]
    async fn test_preview_numbering_continues_across_processes() {
        let (tx, rx) = watch::channel(None);
        let seq = AtomicU64::new(0);
        let frame = PreviewFrame::byte_len(2, 2);

        // First process yields two frames, the restarted one a third
        let first = vec![7u8; frame * 2];
        read_preview_frames(first.as_slice(), (2, 2), &tx, &seq).await;
        assert_eq!(rx.borrow().as_ref().map(|f| f.seq), Some(2));

        let second = vec![9u8; frame + 5];
        read_preview_frames(second.as_slice(), (2, 2), &tx, &seq).await;
        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest.seq, 3);
        assert_eq!(latest.rgb[0], 9);
    }
}
