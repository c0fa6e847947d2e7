use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use thiserror::Error;

use crate::cache::ViewCache;
use crate::dataset::Dataset;
use crate::views::{self, AggregateArgs};

/// Thresholds precomputed when none are given.
pub const DEFAULT_THRESHOLDS: &[f64] = &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9];

#[derive(Error, Debug)]
pub enum WarmError {
    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct WarmResult {
    pub computed: usize,
    pub failed: usize,
}

/// Precompute richness and abundance for every threshold × group-by pair so
/// later queries hit the on-disk view cache.
pub fn warm_views(
    ds: &Dataset,
    cache: &ViewCache,
    thresholds: &[f64],
    group_bys: &[Vec<String>],
    jobs: usize,
    show_progress: bool,
) -> Result<WarmResult, WarmError> {
    let jobs_list: Vec<(bool, AggregateArgs)> = thresholds
        .iter()
        .flat_map(|&threshold| {
            group_bys.iter().flat_map(move |group_by| {
                let args = AggregateArgs {
                    threshold,
                    group_by: group_by.clone(),
                    ..AggregateArgs::default()
                };
                [(true, args.clone()), (false, args)]
            })
        })
        .collect();

    let pb = if show_progress {
        ProgressBar::new(jobs_list.len() as u64)
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} views ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs.max(1)).build()?;

    let outcomes: Vec<bool> = pool.install(|| {
        jobs_list
            .par_iter()
            .map(|(richness, args)| {
                let result = if *richness {
                    views::species_richness(ds, cache, args)
                } else {
                    views::species_abundance(ds, cache, args)
                };
                pb.inc(1);
                match result {
                    Ok(_) => true,
                    Err(e) => {
                        log::warn!(
                            "{}: failed to warm threshold={} group_by={:?}: {e}",
                            ds.name(),
                            args.threshold,
                            args.group_by
                        );
                        false
                    }
                }
            })
            .collect()
    });

    let computed = outcomes.iter().filter(|ok| **ok).count();
    let failed = outcomes.len() - computed;
    pb.finish_with_message(format!("Done: {computed} computed, {failed} failed"));
    Ok(WarmResult { computed, failed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{CONFIG_FILE, SharedSpecies};
    use std::sync::Arc;

    #[test]
    fn test_failures_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[Dataset]\nname = X\naudio_path = /a\n",
        )
        .unwrap();
        let ds = Dataset::open(dir.path(), Arc::new(SharedSpecies::new(dir.path())), 16).unwrap();
        let result = warm_views(
            &ds,
            &ViewCache::default(),
            &[0.5, 0.8],
            &[vec!["site_id".to_string()]],
            2,
            false,
        )
        .unwrap();
        // no tables on disk: every view fails
        assert_eq!(result, WarmResult { computed: 0, failed: 4 });
    }
}
