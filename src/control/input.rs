//! Terminal input decoding into control-plane events.
//!
//! A reader thread switches stdin into raw mode, decodes bytes, escape
//! sequences, and SGR mouse reports into `Event`s, and submits them to the
//! event loop. Rendering is a collaborator's concern; only decoding lives
//! here. A small row cursor tracks the selected queue row for remove/move
//! keys.

use std::io::Read;
use std::sync::mpsc::Sender as StdSender;
use std::thread;

use log::debug;

use crate::control::events::Event;

/// Nominal column count used to turn a mouse column into a progress
/// fraction when no renderer reports the real bar geometry.
const NOMINAL_TERMINAL_COLUMNS: f32 = 80.0;

/// Pending digits typed before a `g` jump, like `12g` for song twelve.
#[derive(Debug, Default)]
struct DigitBuffer {
    digits: String,
}

impl DigitBuffer {
    fn push(&mut self, digit: char) {
        if self.digits.len() < 6 {
            self.digits.push(digit);
        }
    }

    fn take(&mut self) -> Option<usize> {
        let number = self.digits.parse::<usize>().ok();
        self.digits.clear();
        number
    }

    fn clear(&mut self) {
        self.digits.clear();
    }
}

/// Decodes an SGR mouse report body (`<btn;col;row` plus `M`/`m`).
fn decode_mouse_report(body: &[u8], terminator: u8) -> Option<Event> {
    let text = std::str::from_utf8(body).ok()?;
    let mut fields = text.split(';');
    let button = fields.next()?.parse::<u32>().ok()?;
    let column = fields.next()?.parse::<u32>().ok()?;
    let _row = fields.next()?.parse::<u32>().ok()?;

    if terminator == b'm' {
        return Some(Event::SeekDragRelease);
    }
    // Button 0 press or drag-motion (bit 5) maps onto the progress bar.
    if button & 0x3 == 0 {
        let fraction =
            ((column.max(1) - 1) as f32 / (NOMINAL_TERMINAL_COLUMNS - 1.0)).clamp(0.0, 1.0);
        return Some(Event::SeekDrag { fraction });
    }
    None
}

fn decode_escape_sequence(bytes: &[u8], selected_row: &mut usize) -> Option<Event> {
    if let Some(mouse_body) = bytes.strip_prefix(b"[<") {
        let (body, terminator) = mouse_body.split_last().map(|(last, rest)| (rest, *last))?;
        return decode_mouse_report(body, terminator);
    }
    match bytes {
        b"[A" => {
            *selected_row = selected_row.saturating_sub(1);
            Some(Event::ScrollUp)
        }
        b"[B" => {
            *selected_row = selected_row.saturating_add(1);
            Some(Event::ScrollDown)
        }
        b"[C" => Some(Event::SeekForward),
        b"[D" => Some(Event::SeekBack),
        b"[5~" => Some(Event::PageUp),
        b"[6~" => Some(Event::PageDown),
        b"[3~" => Some(Event::RemoveRow(*selected_row)),
        _ => None,
    }
}

fn decode_key(byte: u8, digits: &mut DigitBuffer, selected_row: usize) -> Option<Event> {
    match byte {
        b' ' | b'p' => Some(Event::PlayPause),
        b'\r' | b'\n' => Some(Event::Play),
        b's' => Some(Event::Stop),
        b'n' => Some(Event::NextTrack),
        b'b' => Some(Event::PrevTrack),
        b'+' | b'=' => Some(Event::VolumeUp),
        b'-' => Some(Event::VolumeDown),
        b'z' => Some(Event::ToggleShuffle),
        b'r' => Some(Event::CycleRepeat),
        b'f' => Some(Event::SeekForward),
        b'd' => Some(Event::SeekBack),
        b'a' => Some(Event::AddToFavorites),
        b'x' => Some(Event::ExportFavorites),
        b'u' => Some(Event::UpdateLibrary),
        b'o' => Some(Event::ToggleLibrarySort),
        b'K' => Some(Event::MoveRowUp(selected_row)),
        b'J' => Some(Event::MoveRowDown(selected_row)),
        b'c' => Some(Event::ClearQueueKeepPlaying),
        b'\t' => Some(Event::ViewChange),
        0x0c => Some(Event::Resize),
        b'g' => digits.take().map(Event::SkipToNumbered),
        b'G' => {
            digits.clear();
            Some(Event::SkipToLast)
        }
        b'0'..=b'9' => {
            digits.push(byte as char);
            None
        }
        b'q' => Some(Event::Quit),
        _ => {
            digits.clear();
            None
        }
    }
}

#[cfg(unix)]
mod raw_mode {
    /// Saved terminal attributes, restored on drop.
    pub struct RawModeGuard {
        original: libc::termios,
    }

    impl RawModeGuard {
        pub fn enable() -> Option<RawModeGuard> {
            // Safety: termios calls on the stdin descriptor.
            unsafe {
                if libc::isatty(libc::STDIN_FILENO) == 0 {
                    return None;
                }
                let mut original: libc::termios = std::mem::zeroed();
                if libc::tcgetattr(libc::STDIN_FILENO, &mut original) != 0 {
                    return None;
                }
                let mut raw = original;
                raw.c_lflag &= !(libc::ICANON | libc::ECHO);
                raw.c_cc[libc::VMIN] = 1;
                raw.c_cc[libc::VTIME] = 0;
                if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
                    return None;
                }
                Some(RawModeGuard { original })
            }
        }
    }

    impl Drop for RawModeGuard {
        fn drop(&mut self) {
            unsafe {
                let _ = libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
            }
        }
    }
}

/// Spawns the stdin reader thread. Returns immediately; the thread ends when
/// it decodes a quit key or stdin closes.
pub fn spawn_input_reader(event_sender: StdSender<Event>) {
    thread::Builder::new()
        .name("kew-input".to_string())
        .spawn(move || {
            #[cfg(unix)]
            let _guard = raw_mode::RawModeGuard::enable();

            let mut stdin = std::io::stdin();
            let mut digits = DigitBuffer::default();
            let mut selected_row = 0usize;
            let mut byte = [0u8; 1];
            let mut escape_buffer: Vec<u8> = Vec::new();
            let mut in_escape = false;

            loop {
                match stdin.read(&mut byte) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }

                let event = if in_escape {
                    escape_buffer.push(byte[0]);
                    // Sequences end with a letter or tilde.
                    let terminated = byte[0].is_ascii_alphabetic() || byte[0] == b'~';
                    if terminated {
                        in_escape = false;
                        let decoded = decode_escape_sequence(&escape_buffer, &mut selected_row);
                        escape_buffer.clear();
                        decoded
                    } else if escape_buffer.len() > 24 {
                        in_escape = false;
                        escape_buffer.clear();
                        None
                    } else {
                        None
                    }
                } else if byte[0] == 0x1b {
                    in_escape = true;
                    escape_buffer.clear();
                    None
                } else {
                    decode_key(byte[0], &mut digits, selected_row)
                };

                if let Some(event) = event {
                    let quit = event == Event::Quit;
                    if event_sender.send(event).is_err() {
                        break;
                    }
                    if quit {
                        break;
                    }
                }
            }
            debug!("Input reader stopped");
        })
        .expect("input thread should spawn");
}

#[cfg(test)]
mod tests {
    use super::{decode_escape_sequence, decode_key, DigitBuffer};
    use crate::control::events::Event;

    #[test]
    fn test_transport_keys_decode() {
        let mut digits = DigitBuffer::default();
        assert_eq!(decode_key(b' ', &mut digits, 0), Some(Event::PlayPause));
        assert_eq!(decode_key(b'\r', &mut digits, 0), Some(Event::Play));
        assert_eq!(decode_key(b'n', &mut digits, 0), Some(Event::NextTrack));
        assert_eq!(decode_key(b'b', &mut digits, 0), Some(Event::PrevTrack));
        assert_eq!(decode_key(b'q', &mut digits, 0), Some(Event::Quit));
    }

    #[test]
    fn test_row_keys_carry_the_selected_row() {
        let mut digits = DigitBuffer::default();
        assert_eq!(decode_key(b'K', &mut digits, 4), Some(Event::MoveRowUp(4)));
        assert_eq!(decode_key(b'J', &mut digits, 4), Some(Event::MoveRowDown(4)));
    }

    #[test]
    fn test_digits_then_g_jump_to_numbered_song() {
        let mut digits = DigitBuffer::default();
        assert_eq!(decode_key(b'1', &mut digits, 0), None);
        assert_eq!(decode_key(b'2', &mut digits, 0), None);
        assert_eq!(
            decode_key(b'g', &mut digits, 0),
            Some(Event::SkipToNumbered(12))
        );
        // The buffer resets after the jump.
        assert_eq!(decode_key(b'g', &mut digits, 0), None);
    }

    #[test]
    fn test_unrelated_key_clears_digit_buffer() {
        let mut digits = DigitBuffer::default();
        assert_eq!(decode_key(b'3', &mut digits, 0), None);
        assert_eq!(decode_key(b'.', &mut digits, 0), None);
        assert_eq!(decode_key(b'g', &mut digits, 0), None);
    }

    #[test]
    fn test_arrow_sequences_move_the_row_cursor() {
        let mut row = 3usize;
        assert_eq!(
            decode_escape_sequence(b"[A", &mut row),
            Some(Event::ScrollUp)
        );
        assert_eq!(row, 2);
        assert_eq!(
            decode_escape_sequence(b"[B", &mut row),
            Some(Event::ScrollDown)
        );
        assert_eq!(row, 3);
    }

    #[test]
    fn test_delete_removes_the_selected_row() {
        let mut row = 5usize;
        assert_eq!(
            decode_escape_sequence(b"[3~", &mut row),
            Some(Event::RemoveRow(5))
        );
    }

    #[test]
    fn test_mouse_drag_and_release_decode() {
        let mut row = 0usize;
        match decode_escape_sequence(b"[<0;40;20M", &mut row) {
            Some(Event::SeekDrag { fraction }) => {
                assert!(fraction > 0.45 && fraction < 0.55, "fraction {}", fraction)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            decode_escape_sequence(b"[<0;40;20m", &mut row),
            Some(Event::SeekDragRelease)
        );
    }

    #[test]
    fn test_paging_sequences_decode() {
        let mut row = 0usize;
        assert_eq!(
            decode_escape_sequence(b"[5~", &mut row),
            Some(Event::PageUp)
        );
        assert_eq!(
            decode_escape_sequence(b"[6~", &mut row),
            Some(Event::PageDown)
        );
        assert_eq!(decode_escape_sequence(b"[Z", &mut row), None);
    }
}
