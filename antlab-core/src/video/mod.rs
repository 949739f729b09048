//! video — FFmpeg bridge
//!
//! Decode a video, hand every frame to a callback as packed RGB24 (with its
//! position in decode order), re-encode as H.264 at the source size and frame
//! rate, and mux the result to disk. Audio is stream-copied.
//!
//! Output is all-or-nothing: the encoder writes to a hidden sibling file that
//! is renamed over the target only after the trailer is written.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, decoder, encoder, format, frame, media, software::scaling, util::rational::Rational,
};
use tracing::{debug, info, warn};

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Scaling flags — bilinear is fast and good enough for the decode→encode path.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// A single decoded video frame in RGB24 format.
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in the source stream's time base.
    pub pts: i64,
    /// Position in decode order, starting at 0.
    pub index: usize,
}

/// Basic facts about a video's main stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Frame count from the container, or a duration × fps estimate; 0 if unknown.
    pub frames: u64,
}

/// Open `input_path` and read its stream parameters. Fails if the file cannot
/// be opened or has no video stream.
pub fn probe<P: AsRef<Path>>(input_path: P) -> Result<VideoInfo> {
    let input_path = input_path.as_ref();
    ffmpeg::init().context("failed to initialise FFmpeg")?;
    let ictx = format::input(&input_path)
        .with_context(|| format!("cannot open video file: {}", input_path.display()))?;
    let stream = ictx
        .streams()
        .best(media::Type::Video)
        .context("no video stream found in input")?;

    let decoder = codec::context::Context::from_parameters(stream.parameters())
        .context("failed to build decoder context")?
        .decoder()
        .video()
        .context("failed to open video decoder")?;

    let rate = stream.avg_frame_rate();
    let fps = if rate.denominator() > 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        0.0
    };

    // nb_frames is set by most muxers; fall back to duration × fps estimate.
    let frames = if stream.frames() > 0 {
        stream.frames() as u64
    } else {
        let dur = stream.duration();
        let tb = stream.time_base();
        if dur > 0 && tb.denominator() > 0 && fps > 0.0 {
            let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
            (seconds * fps).round() as u64
        } else {
            0
        }
    };

    Ok(VideoInfo {
        width: decoder.width(),
        height: decoder.height(),
        fps,
        frames,
    })
}

// ── All-or-nothing output ────────────────────────────────────────────────────

/// Hidden sibling of `output` used while encoding. The extension is kept last
/// so FFmpeg still picks the right muxer.
pub fn partial_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match output.extension() {
        Some(ext) => format!(".{stem}.partial.{}", ext.to_string_lossy()),
        None => format!(".{stem}.partial"),
    };
    output.with_file_name(name)
}

/// Run `write` against a temporary path and move the result to `output` only
/// if it succeeds. On failure the temporary file is removed and `output` is
/// left untouched.
pub fn write_atomically<F>(output: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let tmp = partial_path(output);
    if let Err(e) = write(&tmp) {
        if tmp.exists() {
            if let Err(rm) = fs::remove_file(&tmp) {
                warn!(path = %tmp.display(), "failed to remove partial output: {rm}");
            }
        }
        return Err(e);
    }

    if output.exists() {
        fs::remove_file(output)
            .with_context(|| format!("failed to replace existing output: {}", output.display()))?;
        info!(path = %output.display(), "replaced existing output");
    }
    fs::rename(&tmp, output)
        .with_context(|| format!("failed to move {} to {}", tmp.display(), output.display()))?;
    Ok(())
}

// ── Transcode ────────────────────────────────────────────────────────────────

/// Open `input_path`, apply `frame_fn` to every frame (modify it in place;
/// the size must not change), and write the result to `output_path` as
/// H.264. `progress_fn(current_frame, total)` runs after every encoded frame;
/// `total` is only passed through. Returns the number of frames written.
pub fn transcode_with_progress<P, Q, F, G>(
    input_path: P,
    output_path: Q,
    total: u64,
    mut frame_fn: F,
    mut progress_fn: G,
) -> Result<u64>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    F: FnMut(&mut RgbFrame) -> Result<()>,
    G: FnMut(u64, u64),
{
    let input_path = input_path.as_ref();
    let output_path = output_path.as_ref();
    let mut written = 0;
    write_atomically(output_path, |tmp| {
        written = transcode_inner(input_path, tmp, total, &mut frame_fn, &mut progress_fn)?;
        Ok(())
    })?;
    info!(frames = written, output = %output_path.display(), "video written");
    Ok(written)
}

/// Decoder side: compressed packets → RGB24 frames.
struct DecodeState {
    decoder: decoder::Video,
    to_rgb: scaling::Context,
    decoded: frame::Video,
    rgb: frame::Video,
    width: u32,
    height: u32,
}

/// Encoder side: RGB24 frames → H.264 packets in the output container.
struct EncodeState {
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    out_rgb: frame::Video,
    yuv: frame::Video,
    stream_index: usize,
    time_base: Rational,
}

fn transcode_inner(
    input_path: &Path,
    output_path: &Path,
    total: u64,
    frame_fn: &mut dyn FnMut(&mut RgbFrame) -> Result<()>,
    progress_fn: &mut dyn FnMut(u64, u64),
) -> Result<u64> {
    ffmpeg::init().context("failed to initialise FFmpeg")?;

    // ── Input ────────────────────────────────────────────────────────────────
    let mut ictx = format::input(&input_path)
        .with_context(|| format!("cannot open video file: {}", input_path.display()))?;

    let (video_stream_index, video_time_base, frame_rate, video_params) = {
        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        (stream.index(), stream.time_base(), stream.avg_frame_rate(), stream.parameters())
    };
    let audio_in = ictx
        .streams()
        .best(media::Type::Audio)
        .map(|s| (s.index(), s.time_base(), s.parameters()));

    let decoder = codec::context::Context::from_parameters(video_params)
        .context("failed to build decoder context")?
        .decoder()
        .video()
        .context("failed to open video decoder")?;

    let width = decoder.width();
    let height = decoder.height();
    let src_pixel_fmt = decoder.format();
    info!(width, height, ?src_pixel_fmt, "opened input video stream");

    let to_rgb = scaling::Context::get(
        src_pixel_fmt,
        width,
        height,
        format::Pixel::RGB24,
        width,
        height,
        SCALE_FLAGS,
    )
    .context("failed to create to-RGB scaler")?;

    let mut dec = DecodeState {
        decoder,
        to_rgb,
        decoded: frame::Video::empty(),
        rgb: frame::Video::empty(),
        width,
        height,
    };

    // ── Output ───────────────────────────────────────────────────────────────
    let mut octx = format::output(&output_path)
        .with_context(|| format!("could not create output: {}", output_path.display()))?;

    let global_header = octx
        .format()
        .flags()
        .contains(format::flag::Flags::GLOBAL_HEADER);

    let encoder_codec = encoder::find(codec::Id::H264)
        .context("H.264 encoder not found — is FFmpeg built with libx264?")?;

    let (video_out_index, video_encoder) = {
        let mut video_out_stream = octx.add_stream(encoder_codec)?;
        let mut builder = codec::context::Context::new_with_codec(encoder_codec)
            .encoder()
            .video()?;
        builder.set_width(width);
        builder.set_height(height);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(video_time_base);
        builder.set_frame_rate(Some(frame_rate));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }
        let opened = builder
            .open_as_with(
                encoder_codec,
                ffmpeg_next::Dictionary::from_iter([("crf", "18"), ("preset", "fast")]),
            )
            .context("failed to open H.264 encoder")?;
        video_out_stream.set_parameters(&opened);
        (video_out_stream.index(), opened)
    };

    let audio_map = match audio_in {
        Some((ai, in_tb, params)) => {
            let mut audio_out = octx.add_stream(codec::Id::None)?;
            audio_out.set_parameters(params);
            Some((ai, in_tb, audio_out.index()))
        }
        None => None,
    };

    let to_yuv = scaling::Context::get(
        format::Pixel::RGB24,
        width,
        height,
        ENCODE_FORMAT,
        width,
        height,
        SCALE_FLAGS,
    )
    .context("failed to create to-YUV scaler")?;

    format::context::output::dump(&octx, 0, output_path.to_str());
    octx.write_header().context("failed to write output header")?;

    let mut enc = EncodeState {
        encoder: video_encoder,
        to_yuv,
        out_rgb: frame::Video::new(format::Pixel::RGB24, width, height),
        yuv: frame::Video::empty(),
        stream_index: video_out_index,
        time_base: video_time_base,
    };

    // ── Decode / transform / encode loop ────────────────────────────────────
    let mut frame_count = 0u64;

    for (stream, packet) in ictx.packets() {
        let stream_index = stream.index();

        if let Some((ai, in_tb, ao)) = audio_map {
            if stream_index == ai {
                let out_tb = octx
                    .stream(ao)
                    .context("audio output stream vanished")?
                    .time_base();
                let mut pkt = packet.clone();
                pkt.set_stream(ao);
                pkt.rescale_ts(in_tb, out_tb);
                pkt.set_position(-1);
                pkt.write_interleaved(&mut octx)
                    .context("failed to write audio packet")?;
                continue;
            }
        }

        if stream_index != video_stream_index {
            continue;
        }

        dec.decoder
            .send_packet(&packet)
            .context("decoder send_packet")?;
        drain_decoder(&mut dec, &mut enc, &mut octx, &mut frame_count, total, frame_fn, progress_fn)?;
    }

    // Flush decoder
    dec.decoder.send_eof().ok();
    drain_decoder(&mut dec, &mut enc, &mut octx, &mut frame_count, total, frame_fn, progress_fn)?;

    if frame_count == 0 {
        bail!("no video frames were decoded from {}", input_path.display());
    }

    // Flush encoder
    enc.encoder.send_eof().ok();
    flush_encoder(&mut enc, &mut octx)?;

    octx.write_trailer()
        .context("failed to write output trailer")?;

    info!(frame_count, "transcode complete");
    Ok(frame_count)
}

/// Pull every frame the decoder has ready, transform it and encode it.
fn drain_decoder(
    dec: &mut DecodeState,
    enc: &mut EncodeState,
    octx: &mut format::context::Output,
    frame_count: &mut u64,
    total: u64,
    frame_fn: &mut dyn FnMut(&mut RgbFrame) -> Result<()>,
    progress_fn: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    while dec.decoder.receive_frame(&mut dec.decoded).is_ok() {
        dec.to_rgb
            .run(&dec.decoded, &mut dec.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let row_bytes = dec.width as usize * 3;
        let stride = dec.rgb.stride(0);
        let raw = dec.rgb.data(0);
        let mut data = Vec::with_capacity(row_bytes * dec.height as usize);
        for row in 0..dec.height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + row_bytes]);
        }

        let pts = dec.decoded.pts().unwrap_or(*frame_count as i64);
        let mut rgb = RgbFrame {
            data,
            width: dec.width,
            height: dec.height,
            pts,
            index: *frame_count as usize,
        };

        frame_fn(&mut rgb)?;

        if rgb.width != dec.width || rgb.height != dec.height || rgb.data.len() != row_bytes * dec.height as usize {
            bail!(
                "frame callback changed frame {} to {}x{} ({} bytes)",
                rgb.index,
                rgb.width,
                rgb.height,
                rgb.data.len()
            );
        }

        let out_stride = enc.out_rgb.stride(0);
        let plane = enc.out_rgb.data_mut(0);
        for row in 0..dec.height as usize {
            let dst = row * out_stride;
            let src = row * row_bytes;
            plane[dst..dst + row_bytes].copy_from_slice(&rgb.data[src..src + row_bytes]);
        }

        enc.to_yuv
            .run(&enc.out_rgb, &mut enc.yuv)
            .context("to-YUV scaling failed")?;
        enc.yuv.set_pts(Some(pts));
        enc.encoder
            .send_frame(&enc.yuv)
            .context("encoder send_frame")?;
        flush_encoder(enc, octx)?;

        *frame_count += 1;
        progress_fn(*frame_count, total);
        if *frame_count % 100 == 0 {
            debug!(frame_count = *frame_count, "processed frames");
        }
    }
    Ok(())
}

/// Drain all pending packets from the encoder and write them to the muxer.
fn flush_encoder(enc: &mut EncodeState, octx: &mut format::context::Output) -> Result<()> {
    let out_tb = octx
        .stream(enc.stream_index)
        .context("video output stream vanished")?
        .time_base();
    let mut encoded = ffmpeg_next::Packet::empty();
    while enc.encoder.receive_packet(&mut encoded).is_ok() {
        encoded.set_stream(enc.stream_index);
        encoded.rescale_ts(enc.time_base, out_tb);
        encoded
            .write_interleaved(octx)
            .context("failed to write encoded packet")?;
    }
    Ok(())
}
