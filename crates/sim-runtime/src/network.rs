//! Social graph growth for the user being stepped.

use chrono::{DateTime, Utc};
use rand::Rng;
use sim_behavior::bernoulli;
use sim_core::{
    clamp_unit, nudge_unit, Candidate, Connection, Neighborhood, NetworkConfig, User,
    INFLUENCE_CEILING,
};
use tracing::trace;

/// Chance that `user` connects with `candidate`.
pub fn connection_probability(cfg: &NetworkConfig, user: &User, candidate: &Candidate) -> f64 {
    let shared_influence = user.influence_score.min(candidate.influence_score);
    let divisor = if cfg.influence_divisor > 0.0 {
        cfg.influence_divisor
    } else {
        1.0
    };
    clamp_unit(
        cfg.base_probability
            + cfg.density_weight * (user.network_density + candidate.network_density)
            + shared_influence / divisor,
    )
}

/// Try to connect `user` with each candidate in `hood`.
///
/// New pairs are added to `hood.existing` as they form, so calling this again
/// with the same neighborhood never yields the same pair twice. The initiator's
/// density and following count change here; the target's influence and
/// follower count are applied by the repository when the pair is stored.
pub fn grow_network<R: Rng + ?Sized>(
    cfg: &NetworkConfig,
    rng: &mut R,
    user: &mut User,
    hood: &mut Neighborhood,
    now: DateTime<Utc>,
) -> Vec<Connection> {
    let mut formed = Vec::new();
    for candidate in hood.candidates.iter_mut().take(cfg.candidates_per_step) {
        if candidate.id == user.id || hood.existing.contains(&candidate.id) {
            continue;
        }
        let p = connection_probability(cfg, user, candidate);
        if !bernoulli(rng, p) {
            continue;
        }
        hood.existing.insert(candidate.id.clone());
        nudge_unit(&mut user.network_density, cfg.density_increment);
        user.following_count = user.following_count.saturating_add(1);
        candidate.influence_score =
            (candidate.influence_score + cfg.influence_increment).min(INFLUENCE_CEILING);
        trace!(user = %user.id, target = %candidate.id, p, "connection formed");
        formed.push(Connection {
            initiator: user.id.clone(),
            target: candidate.id.clone(),
            created_at: now,
            influence_delta: cfg.influence_increment,
        });
    }
    formed
}
