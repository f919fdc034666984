//! Text attribute codec
//!
//! Tracks SGR state as a packed attribute word plus a packed colour word,
//! and decodes that pair into a style descriptor (class list + inline CSS)
//! attached to every text run.
//!
//! Attribute word layout:
//! - bits 0..8   background index (or red channel in RGB mode)
//! - bits 8..16  foreground index (or red channel in RGB mode)
//! - bits 16..23 style flags ([`StyleFlags`])
//! - bit 24/25   background set / background RGB
//! - bit 26/27   foreground set / foreground RGB
//!
//! Colour word layout (RGB mode only): `fg_g << 24 | bg_g << 16 | fg_b << 8 | bg_b`.

use bitflags::bitflags;
use log::trace;

bitflags! {
    /// Character style flags (stored shifted by [`FLAG_SHIFT`])
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StyleFlags: u32 {
        const BOLD = 1;
        const ITALIC = 2;
        const UNDERLINE = 4;
        const BLINK = 8;
        const INVERSE = 16;
        const CONCEAL = 32;
    }
}

const FLAG_SHIFT: u32 = 16;
const FLAG_MASK: u32 = 0x7f;
const BG_SET: u32 = 1 << 24;
const BG_RGB: u32 = 1 << 25;
const FG_SET: u32 = 1 << 26;
const FG_RGB: u32 = 1 << 27;

/// Class names for each style flag, in bit order
const STYLE_NAMES: [(StyleFlags, &str); 6] = [
    (StyleFlags::BOLD, "bold"),
    (StyleFlags::ITALIC, "italic"),
    (StyleFlags::UNDERLINE, "underline"),
    (StyleFlags::BLINK, "blink"),
    (StyleFlags::INVERSE, "inverse"),
    (StyleFlags::CONCEAL, "conceal"),
];

/// Text color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Terminal default
    Default,
    /// 256-color palette index
    Indexed(u8),
    /// True Color (24bit RGB)
    Rgb(u8, u8, u8),
}

/// Packed SGR state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attributes {
    pub attr: u32,
    pub colors: u32,
}

impl Attributes {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn flags(&self) -> StyleFlags {
        StyleFlags::from_bits_truncate((self.attr >> FLAG_SHIFT) & FLAG_MASK)
    }

    pub fn set_flag(&mut self, flag: StyleFlags) {
        self.attr |= flag.bits() << FLAG_SHIFT;
    }

    pub fn clear_flag(&mut self, flag: StyleFlags) {
        self.attr &= !(flag.bits() << FLAG_SHIFT);
    }

    pub fn set_fg(&mut self, color: Color) {
        self.attr &= !(FG_SET | FG_RGB | 0xff00);
        self.colors &= !0xff00_ff00;
        match color {
            Color::Default => {}
            Color::Indexed(idx) => self.attr |= FG_SET | (idx as u32) << 8,
            Color::Rgb(r, g, b) => {
                self.attr |= FG_SET | FG_RGB | (r as u32) << 8;
                self.colors |= (g as u32) << 24 | (b as u32) << 8;
            }
        }
    }

    pub fn set_bg(&mut self, color: Color) {
        self.attr &= !(BG_SET | BG_RGB | 0xff);
        self.colors &= !0x00ff_00ff;
        match color {
            Color::Default => {}
            Color::Indexed(idx) => self.attr |= BG_SET | idx as u32,
            Color::Rgb(r, g, b) => {
                self.attr |= BG_SET | BG_RGB | r as u32;
                self.colors |= (g as u32) << 16 | b as u32;
            }
        }
    }

    /// Identity of this style, used to tell runs apart
    pub fn style_key(&self, fullwidth: bool) -> String {
        format!("{}@{}@{}", self.attr, self.colors, fullwidth)
    }

    /// Apply an SGR (CSI ... m) parameter list
    pub fn apply_sgr(&mut self, params: &[Vec<u16>]) {
        // No parameters -> reset
        if params.is_empty() {
            self.reset();
            return;
        }

        let mut iter = params.iter().peekable();

        while let Some(param) = iter.next() {
            // Colon-separated sub-parameters (38:2:r:g:b)
            if param.len() > 1 {
                self.apply_sgr_subparams(param);
                continue;
            }

            let code = param.first().copied().unwrap_or(0);
            match code {
                0 => self.reset(),
                1 => self.set_flag(StyleFlags::BOLD),
                3 => self.set_flag(StyleFlags::ITALIC),
                4 => self.set_flag(StyleFlags::UNDERLINE),
                5 => self.set_flag(StyleFlags::BLINK),
                7 => self.set_flag(StyleFlags::INVERSE),
                8 => self.set_flag(StyleFlags::CONCEAL),
                21 | 22 => self.clear_flag(StyleFlags::BOLD),
                23 => self.clear_flag(StyleFlags::ITALIC),
                24 => self.clear_flag(StyleFlags::UNDERLINE),
                25 => self.clear_flag(StyleFlags::BLINK),
                27 => self.clear_flag(StyleFlags::INVERSE),
                28 => self.clear_flag(StyleFlags::CONCEAL),
                30..=37 => self.set_fg(Color::Indexed((code - 30) as u8)),
                38 => {
                    if let Some(color) = parse_extended_color(&mut iter) {
                        self.set_fg(color);
                    }
                }
                39 => self.set_fg(Color::Default),
                40..=47 => self.set_bg(Color::Indexed((code - 40) as u8)),
                48 => {
                    if let Some(color) = parse_extended_color(&mut iter) {
                        self.set_bg(color);
                    }
                }
                49 => self.set_bg(Color::Default),
                90..=97 => self.set_fg(Color::Indexed((code - 90 + 8) as u8)),
                100..=107 => self.set_bg(Color::Indexed((code - 100 + 8) as u8)),
                _ => {
                    trace!("Unhandled SGR: {}", code);
                }
            }
        }
    }

    fn apply_sgr_subparams(&mut self, subparams: &[u16]) {
        let color = match subparams.get(1) {
            Some(5) => subparams.get(2).map(|&idx| Color::Indexed(idx as u8)),
            // 38:2:r:g:b or 38:2:colorspace:r:g:b
            Some(2) if subparams.len() >= 6 => Some(Color::Rgb(
                subparams[3] as u8,
                subparams[4] as u8,
                subparams[5] as u8,
            )),
            Some(2) if subparams.len() == 5 => Some(Color::Rgb(
                subparams[2] as u8,
                subparams[3] as u8,
                subparams[4] as u8,
            )),
            _ => None,
        };
        match (subparams[0], color) {
            (38, Some(color)) => self.set_fg(color),
            (48, Some(color)) => self.set_bg(color),
            (4, _) => {
                if subparams.get(1).copied().unwrap_or(1) == 0 {
                    self.clear_flag(StyleFlags::UNDERLINE);
                } else {
                    self.set_flag(StyleFlags::UNDERLINE);
                }
            }
            _ => trace!("Unhandled SGR sub-parameters: {:?}", subparams),
        }
    }
}

/// Parse extended color (semicolon-separated)
/// Format: 38;5;n or 38;2;r;g;b
fn parse_extended_color(
    iter: &mut std::iter::Peekable<std::slice::Iter<'_, Vec<u16>>>,
) -> Option<Color> {
    let mode = iter.next()?.first().copied()?;
    match mode {
        5 => {
            let idx = iter.next()?.first().copied()?;
            Some(Color::Indexed(idx as u8))
        }
        2 => {
            let r = iter.next()?.first().copied()? as u8;
            let g = iter.next()?.first().copied()? as u8;
            let b = iter.next()?.first().copied()? as u8;
            Some(Color::Rgb(r, g, b))
        }
        _ => None,
    }
}

/// Semantic style of a text run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StyleDescriptor {
    /// Space separated class list (`bold fg1 bg-1`)
    pub classes: String,
    /// Inline CSS for RGB colors
    pub inline: String,
}

impl StyleDescriptor {
    pub fn class_set(&self) -> std::collections::BTreeSet<&str> {
        self.classes.split_whitespace().collect()
    }
}

/// Decode a packed attribute/colour pair into a style descriptor.
///
/// Indexed colours become `fgN`/`bgN` classes, RGB colours become inline
/// `color:`/`background-color:` declarations. Inverse video swaps the
/// roles, falling back to `bg-1`/`fg-1` for an unset side. Bold promotes
/// the first eight foreground indices to their bright variants.
pub fn get_styles(attrs: &Attributes, fullwidth: bool) -> StyleDescriptor {
    let num = attrs.attr;
    let gb = attrs.colors;

    let fg_set = num & FG_SET != 0;
    let bg_set = num & BG_SET != 0;
    let fg_rgb = fg_set && num & FG_RGB != 0;
    let bg_rgb = bg_set && num & BG_RGB != 0;
    let flags = attrs.flags();
    let inverse = flags.contains(StyleFlags::INVERSE);
    let fg_idx = (num >> 8) & 0xff;
    let bg_idx = num & 0xff;
    let intense_on_bold = !fg_rgb && fg_set && flags.contains(StyleFlags::BOLD) && fg_idx < 8;

    let mut classes: Vec<String> = STYLE_NAMES
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, name)| name.to_string())
        .collect();

    if fg_set && !fg_rgb {
        let idx = if intense_on_bold { fg_idx | 8 } else { fg_idx };
        classes.push(format!("{}{}", if inverse { "bg" } else { "fg" }, idx));
    }
    if bg_set && !bg_rgb {
        classes.push(format!("{}{}", if inverse { "fg" } else { "bg" }, bg_idx));
    }
    if inverse && !fg_set {
        classes.push("bg-1".to_string());
    }
    if inverse && !bg_set {
        classes.push("fg-1".to_string());
    }
    if fullwidth {
        classes.push("fw".to_string());
    }

    let mut inline = String::new();
    if fg_rgb {
        inline.push_str(if inverse { "background-color:rgb(" } else { "color:rgb(" });
        inline.push_str(&format!("{},{},{});", fg_idx, gb >> 24, (gb >> 8) & 0xff));
    }
    if bg_rgb {
        inline.push_str(if inverse { "color:rgb(" } else { "background-color:rgb(" });
        inline.push_str(&format!("{},{},{});", bg_idx, (gb >> 16) & 0xff, gb & 0xff));
    }

    StyleDescriptor {
        classes: classes.join(" "),
        inline,
    }
}
