//! Missions
//!
//! Each player carries a few missions drawn at game start. Accepted passes
//! advance them; a completed mission fires its effect once and is replaced
//! by a mission the player has not had yet this game.

use serde::{Serialize, Deserialize};

use crate::core::keypad::is_vowel;
use crate::core::rng::DeterministicRng;
use crate::game::state::PlayerState;

/// Every mission in the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionKind {
    HarmonicRun,
    ConsonantWall,
    PerfectEcho,
    AlphabetStep,
    LightningStrike,
    EdgeOfTheCliff,
    ConstantPressure,
    ForcedUnion,
}

impl MissionKind {
    /// The whole pool.
    pub const ALL: [MissionKind; 8] = [
        MissionKind::HarmonicRun,
        MissionKind::ConsonantWall,
        MissionKind::PerfectEcho,
        MissionKind::AlphabetStep,
        MissionKind::LightningStrike,
        MissionKind::EdgeOfTheCliff,
        MissionKind::ConstantPressure,
        MissionKind::ForcedUnion,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MissionKind::HarmonicRun => "Harmonic Run",
            MissionKind::ConsonantWall => "Consonant Wall",
            MissionKind::PerfectEcho => "Perfect Echo",
            MissionKind::AlphabetStep => "Alphabet Step",
            MissionKind::LightningStrike => "Lightning Strike",
            MissionKind::EdgeOfTheCliff => "Edge of the Cliff",
            MissionKind::ConstantPressure => "Constant Pressure",
            MissionKind::ForcedUnion => "Forced Union",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            MissionKind::HarmonicRun => "Play 3 vowels in a row: the next timeout is divided by 1.3",
            MissionKind::ConsonantWall => "Play 4 consonants in a row: your next turn lasts 1.5x longer",
            MissionKind::PerfectEcho => "Repeat the previous letter: the ball ricochets to the previous passer",
            MissionKind::AlphabetStep => "Play the letter after the previous one: the next holder's keypad is scrambled",
            MissionKind::LightningStrike => "Answer 3 times in under 25% of the timeout: the next timeout is divided by 1.2",
            MissionKind::EdgeOfTheCliff => "Answer after 90% of the timeout: your next turn gets the maximum time",
            MissionKind::ConstantPressure => "Make the 10th exchange: every following timeout is halved",
            MissionKind::ForcedUnion => "Play a 'q': the next holder must play a 'u'",
        }
    }

    /// Steps needed to complete.
    pub fn goal(self) -> u32 {
        match self {
            MissionKind::HarmonicRun => 3,
            MissionKind::ConsonantWall => 4,
            MissionKind::LightningStrike => 3,
            _ => 1,
        }
    }

    fn effect(self) -> MissionEffect {
        match self {
            MissionKind::HarmonicRun => MissionEffect::OpponentFactor(1.0 / 1.3),
            MissionKind::ConsonantWall => MissionEffect::OwnNextTurn(1.5),
            MissionKind::PerfectEcho => MissionEffect::Ricochet,
            MissionKind::AlphabetStep => MissionEffect::ScrambleNext,
            MissionKind::LightningStrike => MissionEffect::OpponentFactor(1.0 / 1.2),
            MissionKind::EdgeOfTheCliff => MissionEffect::FullNextTurn,
            MissionKind::ConstantPressure => MissionEffect::Pace(0.5),
            MissionKind::ForcedUnion => MissionEffect::ForceLetter('u'),
        }
    }
}

/// A mission in a player's hand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mission {
    pub kind: MissionKind,
    pub name: String,
    pub description: String,
    pub goal: u32,
    pub current_step: u32,
}

impl Mission {
    pub fn new(kind: MissionKind) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            description: kind.description().to_string(),
            goal: kind.goal(),
            current_step: 0,
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.current_step >= self.goal
    }

    /// Advance from one accepted pass. Completed missions never move.
    fn advance(&mut self, ctx: &TurnContext) {
        if self.is_completed() {
            return;
        }

        let hit = match self.kind {
            MissionKind::HarmonicRun => is_vowel(ctx.letter),
            MissionKind::ConsonantWall => !is_vowel(ctx.letter),
            MissionKind::PerfectEcho => ctx.previous_letter == Some(ctx.letter),
            MissionKind::AlphabetStep => ctx
                .previous_letter
                .and_then(|p| char::from_u32(p as u32 + 1))
                .map_or(false, |next| next == ctx.letter),
            MissionKind::LightningStrike => {
                (ctx.response_time_ms as f64) < ctx.timeout_ms as f64 * 0.25
            }
            MissionKind::EdgeOfTheCliff => {
                (ctx.response_time_ms as f64) > ctx.timeout_ms as f64 * 0.9
            }
            MissionKind::ConstantPressure => ctx.exchanges > 0 && ctx.exchanges % 10 == 0,
            MissionKind::ForcedUnion => ctx.letter == 'q',
        };

        if hit {
            self.current_step += 1;
        } else if matches!(
            self.kind,
            MissionKind::HarmonicRun | MissionKind::ConsonantWall | MissionKind::LightningStrike
        ) {
            // Streak missions start over
            self.current_step = 0;
        }
    }
}

/// What a pass looked like, from the missions' point of view.
#[derive(Clone, Debug)]
pub struct TurnContext {
    /// Letter just played
    pub letter: char,
    /// Last letter of the word before this pass
    pub previous_letter: Option<char>,
    /// Time the passer took (ms)
    pub response_time_ms: u64,
    /// Time the passer had (ms)
    pub timeout_ms: u64,
    /// Accepted passes this game, including this one
    pub exchanges: usize,
}

/// Effect fired by a completed mission.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionEffect {
    /// Multiply the next holder's timeout.
    OpponentFactor(f64),
    /// Multiply the completer's own next timeout.
    OwnNextTurn(f64),
    /// The completer's next turn gets the maximum timeout.
    FullNextTurn,
    /// Game-wide timeout multiplier from now on.
    Pace(f64),
    /// The ball goes back to the previous passer.
    Ricochet,
    /// The next holder's keypad is scrambled.
    ScrambleNext,
    /// The next holder must play this letter.
    ForceLetter(char),
}

impl MissionEffect {
    /// Name recorded among a turn's applied multipliers.
    pub fn label(&self) -> &'static str {
        match self {
            MissionEffect::OpponentFactor(_) => "mission bonus",
            MissionEffect::OwnNextTurn(_) => "own turn bonus",
            MissionEffect::FullNextTurn => "full turn",
            MissionEffect::Pace(_) => "pace",
            MissionEffect::Ricochet => "ricochet",
            MissionEffect::ScrambleNext => "scramble",
            MissionEffect::ForceLetter(_) => "forced letter",
        }
    }
}

/// Draw `count` distinct missions.
pub fn draw_missions(rng: &mut DeterministicRng, count: usize) -> Vec<Mission> {
    let mut pool = MissionKind::ALL.to_vec();
    rng.shuffle(&mut pool);
    pool.into_iter().take(count).map(Mission::new).collect()
}

/// Advance a player's missions for one pass, retire and replace the
/// completed ones, and return the effects they fired.
pub fn advance_missions(
    player: &mut PlayerState,
    ctx: &TurnContext,
    rng: &mut DeterministicRng,
) -> Vec<MissionEffect> {
    for mission in &mut player.active_missions {
        mission.advance(ctx);
    }

    let (completed, active): (Vec<Mission>, Vec<Mission>) = player
        .active_missions
        .drain(..)
        .partition(Mission::is_completed);
    player.active_missions = active;

    let mut effects = Vec::with_capacity(completed.len());
    for mission in completed {
        tracing::info!("Player {} completed mission '{}'", player.id, mission.name);
        effects.push(mission.kind.effect());
        player.completed_missions.push(mission);

        let fresh: Vec<MissionKind> = MissionKind::ALL
            .iter()
            .copied()
            .filter(|k| {
                !player.active_missions.iter().any(|m| m.kind == *k)
                    && !player.completed_missions.iter().any(|m| m.kind == *k)
            })
            .collect();
        if let Some(&kind) = rng.choose(&fresh) {
            player.active_missions.push(Mission::new(kind));
        }
    }

    effects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::power::PowerPolicy;
    use crate::game::state::PlayerId;

    fn player_with(kinds: &[MissionKind]) -> PlayerState {
        let mut p = PlayerState::new(PlayerId::from_parts("h", 1), &PowerPolicy::default());
        p.active_missions = kinds.iter().copied().map(Mission::new).collect();
        p
    }

    fn ctx(letter: char, previous: char) -> TurnContext {
        TurnContext {
            letter,
            previous_letter: Some(previous),
            response_time_ms: 5_000,
            timeout_ms: 15_000,
            exchanges: 1,
        }
    }

    #[test]
    fn test_draw_is_distinct() {
        let mut rng = DeterministicRng::new(3);
        let missions = draw_missions(&mut rng, 3);
        assert_eq!(missions.len(), 3);
        assert_ne!(missions[0].kind, missions[1].kind);
        assert_ne!(missions[1].kind, missions[2].kind);
        assert_ne!(missions[0].kind, missions[2].kind);
        assert_eq!(draw_missions(&mut rng, 20).len(), 8);
    }

    #[test]
    fn test_harmonic_run_streak() {
        let mut rng = DeterministicRng::new(1);
        let mut p = player_with(&[MissionKind::HarmonicRun]);

        assert!(advance_missions(&mut p, &ctx('a', 'b'), &mut rng).is_empty());
        assert!(advance_missions(&mut p, &ctx('e', 'a'), &mut rng).is_empty());
        // Consonant breaks the streak
        assert!(advance_missions(&mut p, &ctx('t', 'e'), &mut rng).is_empty());
        assert_eq!(p.active_missions[0].current_step, 0);

        for (l, prev) in [('a', 't'), ('e', 'a')] {
            advance_missions(&mut p, &ctx(l, prev), &mut rng);
        }
        let effects = advance_missions(&mut p, &ctx('i', 'e'), &mut rng);
        assert_eq!(effects, vec![MissionEffect::OpponentFactor(1.0 / 1.3)]);
        assert_eq!(p.completed_missions.len(), 1);
        assert!(p.completed_missions[0].is_completed());
    }

    #[test]
    fn test_completed_mission_is_replaced() {
        let mut rng = DeterministicRng::new(9);
        let mut p = player_with(&[MissionKind::ForcedUnion, MissionKind::PerfectEcho]);

        let effects = advance_missions(&mut p, &ctx('q', 'a'), &mut rng);
        assert_eq!(effects, vec![MissionEffect::ForceLetter('u')]);
        assert_eq!(p.active_missions.len(), 2);
        assert!(p.active_missions.iter().all(|m| m.kind != MissionKind::ForcedUnion));
        assert!(p.active_missions.iter().any(|m| m.kind == MissionKind::PerfectEcho));
    }

    #[test]
    fn test_letter_relations() {
        let mut rng = DeterministicRng::new(2);

        let mut p = player_with(&[MissionKind::PerfectEcho]);
        assert_eq!(advance_missions(&mut p, &ctx('o', 'o'), &mut rng), vec![MissionEffect::Ricochet]);

        let mut p = player_with(&[MissionKind::AlphabetStep]);
        assert!(advance_missions(&mut p, &ctx('c', 'a'), &mut rng).is_empty());
        assert_eq!(advance_missions(&mut p, &ctx('d', 'c'), &mut rng), vec![MissionEffect::ScrambleNext]);
    }

    #[test]
    fn test_timing_missions() {
        let mut rng = DeterministicRng::new(4);

        let mut p = player_with(&[MissionKind::EdgeOfTheCliff]);
        let mut late = ctx('b', 'a');
        late.response_time_ms = 14_000;
        assert_eq!(advance_missions(&mut p, &late, &mut rng), vec![MissionEffect::FullNextTurn]);

        let mut p = player_with(&[MissionKind::ConstantPressure]);
        let mut tenth = ctx('b', 'a');
        tenth.exchanges = 9;
        assert!(advance_missions(&mut p, &tenth, &mut rng).is_empty());
        tenth.exchanges = 10;
        assert_eq!(advance_missions(&mut p, &tenth, &mut rng), vec![MissionEffect::Pace(0.5)]);
    }
}
