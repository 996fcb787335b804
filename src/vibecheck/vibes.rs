use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::vibecheck::error::VibeCheckError;

/// How busy a venue feels right now, from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Vibe {
    BagulhoDoido,
    Animado,
    Normal,
    Parado,
    Miado,
}

impl Vibe {
    /// Every vibe in the order the review form offers them.
    pub const ALL: [Vibe; 5] = [
        Vibe::BagulhoDoido,
        Vibe::Animado,
        Vibe::Normal,
        Vibe::Parado,
        Vibe::Miado,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Vibe::BagulhoDoido => "Bagulho Doido",
            Vibe::Animado => "Animado",
            Vibe::Normal => "Normal",
            Vibe::Parado => "Parado",
            Vibe::Miado => "Miado",
        }
    }

    /// 5 for the liveliest vibe down to 1. Also stored as `currentVibeLevel`.
    pub fn intensity(&self) -> u8 {
        match self {
            Vibe::BagulhoDoido => 5,
            Vibe::Animado => 4,
            Vibe::Normal => 3,
            Vibe::Parado => 2,
            Vibe::Miado => 1,
        }
    }

    /// High vibes get highlighted in venue lists.
    pub fn is_high(&self) -> bool {
        self.intensity() >= 4
    }

    /// Intensity of a stored label; unknown or missing labels are 0.
    pub fn intensity_of(label: Option<&str>) -> u8 {
        label
            .and_then(|label| label.parse::<Vibe>().ok())
            .map_or(0, |vibe| vibe.intensity())
    }
}

impl fmt::Display for Vibe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Vibe {
    type Err = VibeCheckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Vibe::ALL
            .into_iter()
            .find(|vibe| vibe.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| VibeCheckError::InvalidInput(format!("Unknown vibe: {}", s)))
    }
}

impl Serialize for Vibe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Vibe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        label.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("bagulho doido".parse::<Vibe>().unwrap(), Vibe::BagulhoDoido);
        assert_eq!("ANIMADO".parse::<Vibe>().unwrap(), Vibe::Animado);
        assert_eq!(" Miado ".parse::<Vibe>().unwrap(), Vibe::Miado);
        assert!("lotado".parse::<Vibe>().is_err());
    }

    #[test]
    fn test_intensity_scale() {
        let levels: Vec<u8> = Vibe::ALL.iter().map(Vibe::intensity).collect();
        assert_eq!(levels, vec![5, 4, 3, 2, 1]);
        assert!(Vibe::Animado.is_high());
        assert!(!Vibe::Normal.is_high());
    }

    #[test]
    fn test_unknown_label_has_zero_intensity() {
        assert_eq!(Vibe::intensity_of(Some("parado")), 2);
        assert_eq!(Vibe::intensity_of(Some("???")), 0);
        assert_eq!(Vibe::intensity_of(None), 0);
    }

    #[test]
    fn test_serde_uses_display_label() {
        let json = serde_json::to_string(&Vibe::BagulhoDoido).unwrap();
        assert_eq!(json, "\"Bagulho Doido\"");
        let vibe: Vibe = serde_json::from_str("\"normal\"").unwrap();
        assert_eq!(vibe, Vibe::Normal);
    }
}
