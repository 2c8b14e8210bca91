use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal::{Clear, ClearType},
};
use png::{BitDepth, ColorType, Encoder};
use tabpdf_core::{RenderImage, SlotId};
use tracing::trace;

pub struct KittyRenderer<W: Write> {
    writer: W,
}

pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Transmits `image` and places it at the cursor. Each slot keeps its own
    /// kitty image id, so redrawing a slot replaces its previous page.
    pub fn draw(&mut self, slot: SlotId, image: &RenderImage, params: DrawParams) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        let image_id = kitty_image_id(slot);
        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;
        trace!(slot, bytes = encoded.len(), "sending page to terminal");

        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p=1,c={},r={},s={},v={},z=-1,m={}",
                    image_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    if more { 1 } else { 0 }
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", if more { 1 } else { 0 })?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Deletes the image a slot is showing, freeing it on the terminal side.
    pub fn erase(&mut self, slot: SlotId) -> Result<()> {
        write!(
            self.writer,
            "\u{1b}_Ga=d,d=I,q=2,i={}\u{1b}\\",
            kitty_image_id(slot)
        )?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// Disables synchronized updates.
    /// The terminal will render all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Clears the entire screen.
    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

fn kitty_image_id(slot: SlotId) -> u32 {
    u32::try_from(slot).unwrap_or(u32::MAX - 1).saturating_add(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabCommand {
    NextPage { count: usize },
    PrevPage { count: usize },
    FirstPage,
    LastPage,
    NextTab { count: usize },
    PrevTab { count: usize },
    /// Zero-based tab position.
    GotoTab { index: usize },
    CloseTab,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Command(TabCommand),
    Resize,
    Quit,
    None,
}

/// Turns key presses into tab commands, keeping numeric prefixes and the
/// `g` leader between events.
#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    char_stack: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code,
                modifiers,
                kind,
                ..
            }) if kind != KeyEventKind::Release => self.map_key(code, modifiers),
            Event::Resize(_, _) => UiEvent::Resize,
            _ => UiEvent::None,
        }
    }

    fn map_key(&mut self, code: KeyCode, modifiers: KeyModifiers) -> UiEvent {
        if self.char_stack == "g" {
            self.reset_char_stack();
            return match code {
                KeyCode::Char('t') => {
                    let command = match self.pending_count.take() {
                        Some(tab) if tab > 0 => TabCommand::GotoTab { index: tab - 1 },
                        _ => TabCommand::NextTab { count: 1 },
                    };
                    self.reset_count();
                    UiEvent::Command(command)
                }
                KeyCode::Char('T') => {
                    let count = self.take_count();
                    UiEvent::Command(TabCommand::PrevTab { count })
                }
                KeyCode::Char('g') => {
                    self.reset_count();
                    UiEvent::Command(TabCommand::FirstPage)
                }
                _ => {
                    self.reset_count();
                    UiEvent::None
                }
            };
        }

        match (code, modifiers) {
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                UiEvent::Quit
            }
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('g'), KeyModifiers::NONE) => {
                self.char_stack.push('g');
                UiEvent::None
            }
            (KeyCode::Char('j'), KeyModifiers::NONE)
            | (KeyCode::Down, KeyModifiers::NONE)
            | (KeyCode::PageDown, _)
            | (KeyCode::Char(' '), KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(TabCommand::NextPage { count })
            }
            (KeyCode::Char('k'), KeyModifiers::NONE)
            | (KeyCode::Up, KeyModifiers::NONE)
            | (KeyCode::PageUp, _) => {
                let count = self.take_count();
                UiEvent::Command(TabCommand::PrevPage { count })
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => {
                self.reset_count();
                UiEvent::Command(TabCommand::LastPage)
            }
            (KeyCode::Home, _) => {
                self.reset_count();
                UiEvent::Command(TabCommand::FirstPage)
            }
            (KeyCode::Tab, KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(TabCommand::NextTab { count })
            }
            (KeyCode::BackTab, _) => {
                let count = self.take_count();
                UiEvent::Command(TabCommand::PrevTab { count })
            }
            (KeyCode::Char('x'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(TabCommand::CloseTab)
            }
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    fn reset_char_stack(&mut self) {
        self.char_stack.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        let mut pending = String::new();
        pending.push_str(&self.pending_digits);
        pending.push_str(&self.char_stack);
        if pending.is_empty() {
            None
        } else {
            Some(pending)
        }
    }
}

/// One-line tab strip. The active tab is bracketed; names are shortened so
/// the whole strip fits in `width` columns.
pub fn format_tab_bar(names: &[&str], active: Option<usize>, width: usize) -> String {
    if names.is_empty() || width == 0 {
        return String::new();
    }
    let per_tab = (width / names.len()).saturating_sub(3).max(1);
    let mut bar = String::new();
    for (index, name) in names.iter().enumerate() {
        let label = truncate_with_ellipsis(name, per_tab);
        if Some(index) == active {
            bar.push_str(&format!("[{}] ", label));
        } else {
            bar.push_str(&format!(" {}  ", label));
        }
    }
    let trimmed = bar.trim_end();
    truncate_with_ellipsis(trimmed, width)
}

fn truncate_with_ellipsis(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_owned();
    }
    if width <= 1 {
        return text.chars().take(width).collect();
    }
    let mut truncated: String = text.chars().take(width - 1).collect();
    truncated.push('…');
    truncated
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;

    #[test]
    fn kitty_draw_emits_protocol() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let image = RenderImage {
            width: 1,
            height: 1,
            pixels: vec![255, 0, 0, 255],
        };

        renderer.draw(0, &image, DrawParams::clamped(10, 5)).unwrap();
        let output = String::from_utf8(renderer.writer).unwrap();
        assert!(output.starts_with("\u{1b}_Ga=T,f=100"));
        assert!(output.contains("i=1,"));
        assert!(output.contains("c=10,r=5,s=1,v=1"));
        assert!(output.ends_with("\u{1b}\\"));
    }

    #[test]
    fn kitty_draw_splits_large_payloads() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let mut state: u32 = 0x9e37_79b9;
        let pixels: Vec<u8> = (0..64 * 64 * 4)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect();
        let image = RenderImage {
            width: 64,
            height: 64,
            pixels,
        };

        renderer.draw(2, &image, DrawParams::clamped(0, 0)).unwrap();
        let output = String::from_utf8(renderer.writer).unwrap();
        assert!(output.contains("i=3,"));
        assert!(output.contains("c=1,r=1"));
        assert!(output.contains("m=1"));
        assert!(output.contains("\u{1b}_Gm=0,q=2;"));
    }

    #[test]
    fn erase_targets_the_slot_image() {
        let mut renderer = KittyRenderer::new(Vec::new());
        renderer.erase(4).unwrap();
        assert_eq!(
            String::from_utf8(renderer.writer).unwrap(),
            "\u{1b}_Ga=d,d=I,q=2,i=5\u{1b}\\"
        );
    }

    fn key_event(code: KeyCode) -> Event {
        key_event_with_modifiers(code, KeyModifiers::NONE)
    }

    fn key_event_with_modifiers(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        })
    }

    #[test]
    fn event_mapper_uses_numeric_prefix_for_next_page() {
        let mut mapper = EventMapper::new();
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('1'))), UiEvent::None);
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('2'))), UiEvent::None);
        assert_eq!(mapper.pending_input().as_deref(), Some("12"));

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('j'))),
            UiEvent::Command(TabCommand::NextPage { count: 12 })
        );
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn event_mapper_resets_prefix_after_use() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('3')));
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('k'))),
            UiEvent::Command(TabCommand::PrevPage { count: 3 })
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('k'))),
            UiEvent::Command(TabCommand::PrevPage { count: 1 })
        );
    }

    #[test]
    fn event_mapper_drops_prefix_on_unmapped_key() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('4')));
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('z'))), UiEvent::None);
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('j'))),
            UiEvent::Command(TabCommand::NextPage { count: 1 })
        );
    }

    #[test]
    fn event_mapper_g_leader_switches_tabs() {
        let mut mapper = EventMapper::new();
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('g'))), UiEvent::None);
        assert_eq!(mapper.pending_input().as_deref(), Some("g"));
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('t'))),
            UiEvent::Command(TabCommand::NextTab { count: 1 })
        );

        mapper.map_event(key_event(KeyCode::Char('g')));
        assert_eq!(
            mapper.map_event(key_event_with_modifiers(KeyCode::Char('T'), KeyModifiers::SHIFT)),
            UiEvent::Command(TabCommand::PrevTab { count: 1 })
        );

        mapper.map_event(key_event(KeyCode::Char('g')));
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('g'))),
            UiEvent::Command(TabCommand::FirstPage)
        );
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn event_mapper_count_before_gt_selects_tab() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('3')));
        mapper.map_event(key_event(KeyCode::Char('g')));
        assert_eq!(mapper.pending_input().as_deref(), Some("3g"));
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('t'))),
            UiEvent::Command(TabCommand::GotoTab { index: 2 })
        );
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn event_mapper_maps_tab_keys_and_close() {
        let mut mapper = EventMapper::new();
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Tab)),
            UiEvent::Command(TabCommand::NextTab { count: 1 })
        );
        assert_eq!(
            mapper.map_event(key_event_with_modifiers(KeyCode::BackTab, KeyModifiers::SHIFT)),
            UiEvent::Command(TabCommand::PrevTab { count: 1 })
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('x'))),
            UiEvent::Command(TabCommand::CloseTab)
        );
    }

    #[test]
    fn event_mapper_quits_on_q_and_ctrl_c() {
        let mut mapper = EventMapper::new();
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('q'))), UiEvent::Quit);
        assert_eq!(
            mapper.map_event(key_event_with_modifiers(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            UiEvent::Quit
        );
    }

    #[test]
    fn event_mapper_ignores_key_release() {
        let mut mapper = EventMapper::new();
        let release = Event::Key(KeyEvent {
            code: KeyCode::Char('j'),
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Release,
            state: KeyEventState::NONE,
        });
        assert_eq!(mapper.map_event(release), UiEvent::None);
        assert_eq!(mapper.map_event(Event::Resize(80, 24)), UiEvent::Resize);
    }

    #[test]
    fn tab_bar_marks_active_tab() {
        let bar = format_tab_bar(&["a.pdf", "b.pdf", "c.pdf"], Some(1), 80);
        assert_eq!(bar, " a.pdf  [b.pdf]  c.pdf");
    }

    #[test]
    fn tab_bar_shortens_long_names() {
        let bar = format_tab_bar(&["quarterly-report.pdf", "notes.pdf"], Some(0), 20);
        assert!(bar.chars().count() <= 20);
        assert!(bar.starts_with("[quarte…]"));
        assert!(format_tab_bar(&[], None, 20).is_empty());
    }
}
