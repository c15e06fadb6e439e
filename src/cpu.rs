/// Pins the calling thread to the given logical core.
///
/// Returns `false` if the core does not exist on this host or the affinity
/// call was rejected. Dispatchers treat a failed pin as fatal; the worker
/// never runs unpinned when a core was requested.
pub fn pin_to_core(core: usize) -> bool {
    match core_affinity::get_core_ids() {
        Some(cores) => cores
            .into_iter()
            .find(|c| c.id == core)
            .map(core_affinity::set_for_current)
            .unwrap_or(false),
        None => false,
    }
}

/// Returns the logical core ids available to this process.
pub fn available_cores() -> Vec<usize> {
    core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .map(|c| c.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_cores_is_not_empty() {
        assert!(
            !available_cores().is_empty(),
            "at least one core must be visible to the test process"
        );
    }

    #[test]
    fn pin_to_first_available_core_succeeds() {
        let cores = available_cores();
        assert!(pin_to_core(cores[0]));
    }

    #[test]
    fn pin_to_bogus_core_fails() {
        assert!(!pin_to_core(usize::MAX));
    }
}
