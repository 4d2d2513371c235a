use crate::error::PipelineError;
use crate::types::{CanonicalAudio, SampleI16, CANONICAL_SAMPLE_RATE};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// 任意の入力音声を正規形に変換
///
/// コンテナ・コーデックを自動判別してデコードし、モノラル・16kHz・
/// 16bit PCMの正規音声を生成する。OGG/Opus（ボイスメッセージの標準
/// フォーマット）は専用経路でデコードし、それ以外はsymphoniaの
/// プローブに委ねる。音声長はデコード結果のバッファから計測する。
///
/// # Arguments
///
/// * `data` - 入力ファイルの生バイト列
/// * `extension_hint` - 拡張子のヒント（"oga" など）。不明なら None
///
/// # Errors
///
/// 入力を音声として解釈できない場合に `PipelineError::Decode` を返す。
pub fn normalize(data: &[u8], extension_hint: Option<&str>) -> Result<CanonicalAudio, PipelineError> {
    // symphoniaはOpusコーデックを登録しないため、先に判別して分岐する
    if is_ogg_opus(data) {
        return decode_ogg_opus(data);
    }

    let cursor = Cursor::new(data.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension_hint {
        hint.with_extension(ext);
    }

    let format_opts = FormatOptions::default();
    let metadata_opts = MetadataOptions::default();
    let decoder_opts = DecoderOptions::default();

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &format_opts, &metadata_opts)
        .map_err(|e| PipelineError::Decode(format!("probe: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| PipelineError::Decode("音声トラックが見つかりません".to_string()))?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let source_rate = codec_params
        .sample_rate
        .ok_or_else(|| PipelineError::Decode("サンプリングレートが不明".to_string()))?;
    let channels = codec_params.channels.map(|c| c.count()).unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &decoder_opts)
        .map_err(|e| PipelineError::Decode(format!("codec: {}", e)))?;

    let mut mono_samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                return Err(PipelineError::Decode(format!("packet: {}", e)));
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                // 壊れたフレームは読み飛ばす
                log::warn!("破損した音声フレームをスキップ: {}", e);
                continue;
            }
            Err(e) => {
                return Err(PipelineError::Decode(format!("decode: {}", e)));
            }
        };

        let spec = *decoded.spec();
        let num_frames = decoded.frames();
        if num_frames == 0 {
            continue;
        }

        let mut sample_buf = SampleBuffer::<f32>::new(num_frames as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        let samples = sample_buf.samples();

        // マルチチャンネルは平均してモノラル化
        if channels > 1 {
            for frame in samples.chunks(channels) {
                let mono: f32 = frame.iter().sum::<f32>() / channels as f32;
                mono_samples.push(mono);
            }
        } else {
            mono_samples.extend_from_slice(samples);
        }
    }

    if mono_samples.is_empty() {
        return Err(PipelineError::Decode(
            "音声サンプルがデコードできませんでした".to_string(),
        ));
    }

    // サンプリングレートが異なる場合は16kHzにリサンプル
    if source_rate != CANONICAL_SAMPLE_RATE {
        mono_samples = resample(&mono_samples, source_rate, CANONICAL_SAMPLE_RATE)?;
    }

    let samples: Vec<SampleI16> = mono_samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect();

    let audio = CanonicalAudio::new(samples);

    log::debug!(
        "音声を正規化: {}サンプル ({:.2}秒, 元レート {}Hz, {}ch)",
        audio.samples.len(),
        audio.duration_seconds(),
        source_rate,
        channels
    );

    Ok(audio)
}

/// OGG/Opusストリームの判定
///
/// 先頭ページのcapture pattern（OggS）と、ページ内のOpusHeadマジックで
/// 判定する。拡張子ヒントに頼らず内容で判別できる。
fn is_ogg_opus(data: &[u8]) -> bool {
    data.starts_with(b"OggS")
        && data[..data.len().min(128)]
            .windows(8)
            .any(|w| w == b"OpusHead")
}

/// OGG/Opusストリームを正規形にデコード
///
/// Opusデコーダは出力レートを選べるため、16kHzモノラルで直接
/// デコードする（マルチチャンネルストリームはデコーダがダウンミックス
/// する）。OpusHeadのプリスキップ（48kHz基準のサンプル数）は
/// 正規レートに換算して先頭から除去する。
fn decode_ogg_opus(data: &[u8]) -> Result<CanonicalAudio, PipelineError> {
    let mut reader = ogg::PacketReader::new(Cursor::new(data));

    let head = reader
        .read_packet()
        .map_err(|e| PipelineError::Decode(format!("ogg: {}", e)))?
        .ok_or_else(|| PipelineError::Decode("OGGストリームが空です".to_string()))?;

    if head.data.len() < 19 || !head.data.starts_with(b"OpusHead") {
        return Err(PipelineError::Decode(
            "OpusHeadヘッダが見つかりません".to_string(),
        ));
    }

    let serial = head.stream_serial();
    let pre_skip_48k = u16::from_le_bytes([head.data[10], head.data[11]]) as usize;

    let mut decoder = opus::Decoder::new(CANONICAL_SAMPLE_RATE, opus::Channels::Mono)
        .map_err(|e| PipelineError::Decode(format!("opus: {}", e)))?;

    let mut samples: Vec<SampleI16> = Vec::new();
    // 最大フレーム長は120ms
    let mut frame = vec![0i16; (CANONICAL_SAMPLE_RATE as usize / 1000) * 120];
    let mut seen_audio = false;

    loop {
        let packet = match reader.read_packet() {
            Ok(Some(p)) => p,
            Ok(None) => break,
            Err(e) => return Err(PipelineError::Decode(format!("ogg: {}", e))),
        };

        if packet.stream_serial() != serial {
            continue;
        }

        // コメントヘッダ（OpusTags）は音声パケットではない
        if !seen_audio && packet.data.starts_with(b"OpusTags") {
            continue;
        }
        seen_audio = true;

        match decoder.decode(&packet.data, &mut frame, false) {
            Ok(n) => samples.extend_from_slice(&frame[..n]),
            Err(e) => {
                // 壊れたパケットは読み飛ばす
                log::warn!("破損したOpusパケットをスキップ: {}", e);
            }
        }
    }

    let pre_skip = pre_skip_48k * CANONICAL_SAMPLE_RATE as usize / 48_000;
    if samples.len() <= pre_skip {
        return Err(PipelineError::Decode(
            "Opus音声サンプルがデコードできませんでした".to_string(),
        ));
    }
    samples.drain(..pre_skip);

    let audio = CanonicalAudio::new(samples);

    log::debug!(
        "OGG/Opusを正規化: {}サンプル ({:.2}秒)",
        audio.samples.len(),
        audio.duration_seconds()
    );

    Ok(audio)
}

/// rubatoによるリサンプリング
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, PipelineError> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let chunk_size = 1024;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
        .map_err(|e| PipelineError::Decode(format!("resampler init: {}", e)))?;

    let mut output = Vec::with_capacity((samples.len() as f64 * ratio) as usize + chunk_size);

    for chunk in samples.chunks(chunk_size) {
        // 端数チャンクは無音でパディング
        let input = if chunk.len() < chunk_size {
            let mut padded = chunk.to_vec();
            padded.resize(chunk_size, 0.0);
            padded
        } else {
            chunk.to_vec()
        };

        let result = resampler
            .process(&[input], None)
            .map_err(|e| PipelineError::Decode(format!("resample: {}", e)))?;

        if let Some(channel) = result.first() {
            output.extend_from_slice(channel);
        }
    }

    // パディング分を含むため、期待長にトリミング
    let expected_len = (samples.len() as f64 * ratio) as usize;
    output.truncate(expected_len);

    Ok(output)
}
