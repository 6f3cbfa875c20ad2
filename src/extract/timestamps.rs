/// Mosaic sampling window: frames are taken from [5%, 95%] of the duration,
/// weighted so the middle of the video contributes most tiles.
const SPAN_START: f64 = 0.05;
const FIRST_BREAK: f64 = 0.38;
const SECOND_BREAK: f64 = 0.67;
const SPAN_END: f64 = 0.95;

/// Selects `count` extraction timestamps across a video of `duration`
/// seconds: 20% of tiles over [5%, 38%], 60% over [38%, 67%], and the
/// remainder over [67%, 95%]. The first timestamp lands exactly on 5% and
/// the last exactly on 95%.
pub fn mosaic_timestamps(duration: f64, count: usize) -> Vec<f64> {
    if count == 0 || duration <= 0.0 {
        return Vec::new();
    }
    if count == 1 {
        return vec![duration * SPAN_START];
    }

    let first = ((count as f64) * 0.2).round() as usize;
    let middle = ((count as f64) * 0.6).round() as usize;
    let first = first.min(count);
    let middle = middle.min(count - first);
    let last = count - first - middle;

    let mut timestamps = Vec::with_capacity(count);

    let a = duration * SPAN_START;
    let b = duration * FIRST_BREAK;
    for i in 0..first {
        timestamps.push(a + (b - a) * i as f64 / first as f64);
    }

    let a = duration * FIRST_BREAK;
    let b = duration * SECOND_BREAK;
    for i in 0..middle {
        timestamps.push(a + (b - a) * i as f64 / middle as f64);
    }

    let a = duration * SECOND_BREAK;
    let b = duration * SPAN_END;
    if last == 1 {
        timestamps.push(b);
    } else {
        for i in 0..last {
            timestamps.push(a + (b - a) * i as f64 / (last - 1) as f64);
        }
    }

    timestamps
}
