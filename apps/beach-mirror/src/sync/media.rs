use crate::protocol::payload::{MediaCommand, MediaOptions, SetMediaState};
use crate::protocol::{AssetId, Message, Payload};

/// A media instance that is still playing on some actor. `message` is the
/// `start` command with every later `update` folded into its options, and
/// `basis_time_ms` is the wall clock at which `options.time` was accurate.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveMediaInstance {
    pub message: Message,
    pub basis_time_ms: u64,
    /// When playback reaches the end of the asset. `None` while looping,
    /// paused, or when the asset duration is unknown.
    pub expiration_time_ms: Option<u64>,
}

/// Playback speed multiplier for a pitch shift in semitones.
pub fn playback_rate(pitch: Option<f64>) -> f64 {
    2f64.powf(pitch.unwrap_or(0.0) / 12.0)
}

impl ActiveMediaInstance {
    fn start(message: Message, duration: Option<f64>, now_ms: u64) -> Self {
        let mut instance = Self {
            message,
            basis_time_ms: now_ms,
            expiration_time_ms: None,
        };
        instance.expiration_time_ms = instance.expiration(duration);
        instance
    }

    pub fn state(&self) -> Option<&SetMediaState> {
        match &self.message.payload {
            Payload::SetMediaState(state) => Some(state),
            _ => None,
        }
    }

    fn options_mut(&mut self) -> Option<&mut MediaOptions> {
        match &mut self.message.payload {
            Payload::SetMediaState(state) => Some(&mut state.options),
            _ => None,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration_time_ms.is_some_and(|expires| now_ms >= expires)
    }

    /// Playback position in seconds at `now_ms`.
    pub fn current_time(&self, duration: Option<f64>, now_ms: u64) -> f64 {
        let Some(state) = self.state() else {
            return 0.0;
        };
        let options = &state.options;
        let start = options.time.unwrap_or(0.0);
        if options.paused.unwrap_or(false) {
            return start;
        }
        let elapsed = now_ms.saturating_sub(self.basis_time_ms) as f64 / 1000.0;
        let position = start + elapsed * playback_rate(options.pitch);
        match duration.filter(|d| *d > 0.0) {
            Some(duration) if options.looping.unwrap_or(false) => position.rem_euclid(duration),
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    /// A `start` command that resumes playback where it currently is.
    pub fn replay(&self, duration: Option<f64>, now_ms: u64) -> Message {
        let current = self.current_time(duration, now_ms);
        let mut message = self.message.replayed();
        if let Payload::SetMediaState(state) = &mut message.payload {
            state.media_command = MediaCommand::Start;
            state.options.time = Some(current);
        }
        message
    }

    fn expiration(&self, duration: Option<f64>) -> Option<u64> {
        let options = &self.state()?.options;
        if options.looping.unwrap_or(false) || options.paused.unwrap_or(false) {
            return None;
        }
        let remaining = duration? - options.time.unwrap_or(0.0);
        if remaining <= 0.0 {
            return Some(self.basis_time_ms);
        }
        let wall_ms = remaining / playback_rate(options.pitch) * 1000.0;
        Some(self.basis_time_ms + wall_ms.ceil() as u64)
    }
}

/// Applies one `set-media-state` command to an actor's active instances.
/// Finished instances are collected first. `duration_of` resolves an asset's
/// length in seconds; an update may omit the asset, in which case the
/// one the instance was started with is used.
pub fn apply_media_command(
    instances: &mut Vec<ActiveMediaInstance>,
    message: &Message,
    duration_of: impl Fn(AssetId) -> Option<f64>,
    now_ms: u64,
) {
    instances.retain(|instance| !instance.is_expired(now_ms));
    let Payload::SetMediaState(command) = &message.payload else {
        return;
    };
    match command.media_command {
        MediaCommand::Start => {
            instances.retain(|instance| {
                instance.state().is_some_and(|state| {
                    state.id != command.id
                        && !(command.media_asset_id.is_some()
                            && state.actor_id == command.actor_id
                            && state.media_asset_id == command.media_asset_id)
                })
            });
            let duration = command.media_asset_id.and_then(&duration_of);
            let instance = ActiveMediaInstance::start(message.clone(), duration, now_ms);
            if !instance.is_expired(now_ms) {
                instances.push(instance);
            }
        }
        MediaCommand::Update => {
            let Some(instance) = instances
                .iter_mut()
                .find(|instance| instance.state().is_some_and(|state| state.id == command.id))
            else {
                return;
            };
            let duration = command
                .media_asset_id
                .or_else(|| instance.state().and_then(|state| state.media_asset_id))
                .and_then(&duration_of);
            let current = instance.current_time(duration, now_ms);
            if let Some(options) = instance.options_mut() {
                options.time = Some(current);
                options.merge(&command.options);
            }
            instance.basis_time_ms = now_ms;
            instance.expiration_time_ms = instance.expiration(duration);
            instances.retain(|instance| !instance.is_expired(now_ms));
        }
        MediaCommand::Stop => {
            instances.retain(|instance| instance.state().is_some_and(|state| state.id != command.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use uuid::Uuid;

    fn command(id: Uuid, media_command: MediaCommand, options: MediaOptions) -> Message {
        Message::new(Payload::SetMediaState(SetMediaState {
            id,
            actor_id: Uuid::nil(),
            media_asset_id: Some(Uuid::nil()),
            media_command,
            options,
        }))
    }

    fn options(time: f64, pitch: f64, looping: bool) -> MediaOptions {
        MediaOptions {
            time: Some(time),
            pitch: Some(pitch),
            looping: Some(looping),
            paused: None,
            extra: Map::new(),
        }
    }

    fn known(duration: Option<f64>) -> impl Fn(AssetId) -> Option<f64> {
        move |_| duration
    }

    fn replayed_time(instance: &ActiveMediaInstance, duration: Option<f64>, now_ms: u64) -> f64 {
        match instance.replay(duration, now_ms).payload {
            Payload::SetMediaState(state) => state.options.time.unwrap(),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn looping_instance_resumes_at_wrapped_position() {
        let mut instances = Vec::new();
        let start = command(Uuid::new_v4(), MediaCommand::Start, options(0.0, 0.0, true));
        apply_media_command(&mut instances, &start, known(Some(10.0)), 0);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].expiration_time_ms, None);

        let time = replayed_time(&instances[0], Some(10.0), 25_000);
        assert!((time - 5.0).abs() < 1e-9, "time was {time}");
    }

    #[test_timeout::timeout]
    fn octave_up_plays_twice_as_fast() {
        let mut instances = Vec::new();
        let start = command(Uuid::new_v4(), MediaCommand::Start, options(0.0, 12.0, false));
        apply_media_command(&mut instances, &start, known(Some(10.0)), 1_000);
        assert_eq!(instances[0].expiration_time_ms, Some(6_000));

        let time = replayed_time(&instances[0], Some(10.0), 3_000);
        assert!((time - 4.0).abs() < 1e-9, "time was {time}");
    }

    #[test_timeout::timeout]
    fn finished_instances_are_collected_on_next_command() {
        let mut instances = Vec::new();
        let first = command(Uuid::new_v4(), MediaCommand::Start, options(0.0, 0.0, false));
        apply_media_command(&mut instances, &first, known(Some(2.0)), 0);
        let second = Message::new(Payload::SetMediaState(SetMediaState {
            id: Uuid::new_v4(),
            actor_id: Uuid::new_v4(),
            media_asset_id: Some(Uuid::new_v4()),
            media_command: MediaCommand::Start,
            options: options(0.0, 0.0, true),
        }));
        apply_media_command(&mut instances, &second, known(None), 5_000);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].message, second);
    }

    #[test_timeout::timeout]
    fn update_rebases_position_and_stop_removes() {
        let id = Uuid::new_v4();
        let mut instances = Vec::new();
        apply_media_command(
            &mut instances,
            &command(id, MediaCommand::Start, options(0.0, 0.0, false)),
            known(Some(60.0)),
            0,
        );
        let pause = MediaOptions {
            paused: Some(true),
            ..MediaOptions::default()
        };
        apply_media_command(&mut instances, &command(id, MediaCommand::Update, pause), known(Some(60.0)), 4_000);
        assert_eq!(instances[0].basis_time_ms, 4_000);
        assert_eq!(instances[0].expiration_time_ms, None);
        assert!((replayed_time(&instances[0], Some(60.0), 50_000) - 4.0).abs() < 1e-9);

        apply_media_command(
            &mut instances,
            &command(id, MediaCommand::Stop, MediaOptions::default()),
            known(Some(60.0)),
            51_000,
        );
        assert!(instances.is_empty());
    }

    #[test_timeout::timeout]
    fn restarting_same_asset_on_actor_replaces_instance() {
        let mut instances = Vec::new();
        apply_media_command(
            &mut instances,
            &command(Uuid::new_v4(), MediaCommand::Start, options(0.0, 0.0, true)),
            known(None),
            0,
        );
        let replacement = command(Uuid::new_v4(), MediaCommand::Start, options(1.0, 0.0, true));
        apply_media_command(&mut instances, &replacement, known(None), 10);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].message, replacement);
    }

    #[test_timeout::timeout]
    fn update_without_asset_keeps_started_assets_duration() {
        let id = Uuid::new_v4();
        let sound = Uuid::new_v4();
        let durations = move |asset_id: AssetId| (asset_id == sound).then_some(2.0);
        let mut instances = Vec::new();
        let start = Message::new(Payload::SetMediaState(SetMediaState {
            id,
            actor_id: Uuid::nil(),
            media_asset_id: Some(sound),
            media_command: MediaCommand::Start,
            options: options(0.0, 0.0, false),
        }));
        apply_media_command(&mut instances, &start, durations, 0);
        assert_eq!(instances[0].expiration_time_ms, Some(2_000));

        let update = Message::new(Payload::SetMediaState(SetMediaState {
            id,
            actor_id: Uuid::nil(),
            media_asset_id: None,
            media_command: MediaCommand::Update,
            options: MediaOptions {
                pitch: Some(12.0),
                ..MediaOptions::default()
            },
        }));
        apply_media_command(&mut instances, &update, durations, 1_000);
        assert_eq!(instances[0].expiration_time_ms, Some(1_500));
        assert!(instances[0].is_expired(1_500));
    }
}
