//! Mode catalogs: vendor and standard selection values to [`Modes`].

use tether_core::op::{Mode, Modes};

/// 3GPP TS 27.007 `+WS46` `<n>` values.
const WS46: &[(u32, &[Mode])] = &[
    (12, &[Mode::G2]),
    (22, &[Mode::G3]),
    (25, &[Mode::G2, Mode::G3, Mode::G4]),
    (28, &[Mode::G4]),
    (29, &[Mode::G2, Mode::G3]),
    (30, &[Mode::G2, Mode::G4]),
    (31, &[Mode::G3, Mode::G4]),
    (35, &[Mode::G5]),
    (36, &[Mode::G4, Mode::G5]),
    (37, &[Mode::G3, Mode::G4, Mode::G5]),
    (38, &[Mode::G2, Mode::G3, Mode::G4, Mode::G5]),
    (39, &[Mode::G3, Mode::G5]),
    (40, &[Mode::G2, Mode::G3, Mode::G5]),
];

pub fn ws46_modes(n: u32) -> Option<Modes> {
    WS46.iter().find(|(v, _)| *v == n).map(|(_, modes)| Modes {
        allowed: sorted(modes),
        preferred: None,
    })
}

/// Huawei `^SYSCFGEX` `<acqorder>` two-digit codes.
fn syscfgex_mode(code: &str) -> Option<Mode> {
    match code {
        "01" => Some(Mode::G2),
        "02" => Some(Mode::G3),
        "03" => Some(Mode::G4),
        "08" => Some(Mode::G5),
        _ => None,
    }
}

/// Parse an `<acqorder>` string such as `"030201"`. `"00"` means automatic:
/// everything allowed, nothing preferred.
pub fn syscfgex_modes(acqorder: &str) -> Option<Modes> {
    if acqorder == "00" {
        return Some(Modes {
            allowed: vec![Mode::G2, Mode::G3, Mode::G4],
            preferred: None,
        });
    }
    if acqorder.is_empty() || acqorder.len() % 2 != 0 {
        return None;
    }
    let order: Vec<Mode> = acqorder
        .as_bytes()
        .chunks(2)
        .map(|c| std::str::from_utf8(c).ok().and_then(syscfgex_mode))
        .collect::<Option<_>>()?;
    let preferred = (order.len() > 1).then(|| order[0]);
    Some(Modes {
        allowed: sorted(&order),
        preferred,
    })
}

/// QMI NAS mode preference bitmask.
pub fn nas_mode_pref(mask: u16) -> Modes {
    const BITS: &[(u16, Mode)] = &[
        (1 << 2, Mode::G2),
        (1 << 3, Mode::G3),
        (1 << 4, Mode::G4),
        (1 << 6, Mode::G5),
    ];
    let allowed = BITS
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, m)| *m)
        .collect();
    Modes {
        allowed,
        preferred: None,
    }
}

fn sorted(modes: &[Mode]) -> Vec<Mode> {
    let mut v = modes.to_vec();
    v.sort();
    v.dedup();
    v
}
