use crate::config::Density;

/// Splice plan for a condensed preview: how many segments to pull, how long
/// each runs in the output, and how much each is sped up.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPlan {
    pub extract_count: usize,
    pub per_segment_duration: f64,
    pub speed_multiplier: f64,
    /// Source start time of each segment, uniformly spaced.
    pub starts: Vec<f64>,
}

impl SegmentPlan {
    /// Total duration of the assembled output.
    pub fn output_duration(&self) -> f64 {
        self.extract_count as f64 * self.per_segment_duration / self.speed_multiplier
    }
}

/// Derives the segment plan from source duration and density. Segment rate
/// decays with duration so long sources do not explode into hundreds of
/// cuts; the per-segment floor and the speed cap bound the output.
pub fn segment_plan(
    duration: f64,
    density: Density,
    preview_duration: f64,
    max_speed_multiplier: f64,
) -> SegmentPlan {
    let duration_min = duration / 60.0;
    let base_extracts_per_minute = if duration <= 0.0 {
        12.0
    } else {
        (12.0 / (1.0 + 0.2 * duration_min)) / density.extract_multiplier()
    };

    let extract_count = ((duration_min * base_extracts_per_minute).ceil() as usize).max(4);
    let per_segment_duration = (preview_duration / extract_count as f64).max(0.5);
    let speed_multiplier = (per_segment_duration * extract_count as f64 / preview_duration)
        .min(max_speed_multiplier);

    let span = (duration - per_segment_duration).max(0.0);
    let starts = (0..extract_count)
        .map(|i| {
            if extract_count == 1 {
                0.0
            } else {
                span * i as f64 / (extract_count - 1) as f64
            }
        })
        .collect();

    SegmentPlan {
        extract_count,
        per_segment_duration,
        speed_multiplier,
        starts,
    }
}
