//! Hidden per-round actions. The relay treats targets, destinations, and
//! auxiliary values as opaque payload fields; their game-world meaning lives
//! outside this crate.

use crate::{read_string, string_encode_size, write_string, Identity};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};

/// Maximum length of a destination (location/sector) name.
pub const MAX_DESTINATION_LENGTH: usize = 128;

/// The kind of a hidden action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ActionKind {
    Move = 0,
    Kill = 1,
    ReportBody = 2,
    Vote = 3,
    CompleteTask = 4,
    Sabotage = 5,
}

impl ActionKind {
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Move),
            1 => Some(Self::Kill),
            2 => Some(Self::ReportBody),
            3 => Some(Self::Vote),
            4 => Some(Self::CompleteTask),
            5 => Some(Self::Sabotage),
            _ => None,
        }
    }
}

impl Write for ActionKind {
    fn write(&self, writer: &mut impl BufMut) {
        self.tag().write(writer);
    }
}

impl Read for ActionKind {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let tag = u8::read(reader)?;
        Self::from_tag(tag).ok_or(Error::Invalid("ActionKind", "unknown tag"))
    }
}

impl EncodeSize for ActionKind {
    fn encode_size(&self) -> usize {
        1
    }
}

/// One hidden action. Fields that do not apply to the kind are `None`.
///
/// An empty `destination` and a zero `auxiliary` are canonically identical to
/// absent (see [`crate::commitment`]); [`GameAction::normalized`] folds them
/// to `None` so every implementation hashes the same bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameAction {
    pub kind: ActionKind,
    /// Another participant (kill victim, vote target, reported body).
    pub target: Option<Identity>,
    /// Opaque location/sector name for moves and reports.
    pub destination: Option<String>,
    /// Opaque task or sabotage identifier.
    pub auxiliary: Option<u64>,
}

impl GameAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            target: None,
            destination: None,
            auxiliary: None,
        }
    }

    pub fn with_target(mut self, target: Identity) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_auxiliary(mut self, auxiliary: u64) -> Self {
        self.auxiliary = Some(auxiliary);
        self
    }

    /// Folds values that encode identically to "absent" down to `None`.
    pub fn normalized(mut self) -> Self {
        if self.destination.as_deref() == Some("") {
            self.destination = None;
        }
        if self.auxiliary == Some(0) {
            self.auxiliary = None;
        }
        self
    }
}

impl Write for GameAction {
    fn write(&self, writer: &mut impl BufMut) {
        self.kind.write(writer);
        self.target.write(writer);
        match &self.destination {
            Some(destination) => {
                true.write(writer);
                write_string(destination, writer);
            }
            None => false.write(writer),
        }
        self.auxiliary.write(writer);
    }
}

impl Read for GameAction {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let kind = ActionKind::read(reader)?;
        let target = Option::<Identity>::read(reader)?;
        let destination = if bool::read(reader)? {
            Some(read_string(reader, MAX_DESTINATION_LENGTH)?)
        } else {
            None
        };
        let auxiliary = Option::<u64>::read(reader)?;
        Ok(Self {
            kind,
            target,
            destination,
            auxiliary,
        })
    }
}

impl EncodeSize for GameAction {
    fn encode_size(&self) -> usize {
        self.kind.encode_size()
            + self.target.encode_size()
            + match &self.destination {
                Some(destination) => 1 + string_encode_size(destination),
                None => 1,
            }
            + self.auxiliary.encode_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt, Encode};
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt, Signer};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_action_roundtrip() {
        let mut rng = StdRng::seed_from_u64(1);
        let target = PrivateKey::from_rng(&mut rng).public_key();
        for action in [
            GameAction::new(ActionKind::Move).with_destination("reactor"),
            GameAction::new(ActionKind::Kill).with_target(target.clone()),
            GameAction::new(ActionKind::ReportBody)
                .with_target(target)
                .with_destination("cafeteria"),
            GameAction::new(ActionKind::CompleteTask).with_auxiliary(17),
            GameAction::new(ActionKind::Sabotage).with_auxiliary(3),
        ] {
            let decoded = GameAction::decode(&mut action.encode().as_ref()).unwrap();
            assert_eq!(action, decoded);
        }
    }

    #[test]
    fn test_normalized_folds_sentinels() {
        let action = GameAction::new(ActionKind::Move)
            .with_destination("")
            .with_auxiliary(0)
            .normalized();
        assert_eq!(action.destination, None);
        assert_eq!(action.auxiliary, None);

        let action = GameAction::new(ActionKind::Move)
            .with_destination("engine")
            .with_auxiliary(2)
            .normalized();
        assert_eq!(action.destination.as_deref(), Some("engine"));
        assert_eq!(action.auxiliary, Some(2));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut bytes = GameAction::new(ActionKind::Move).encode().to_vec();
        bytes[0] = 9;
        assert!(GameAction::decode(&mut bytes.as_slice()).is_err());
    }
}
