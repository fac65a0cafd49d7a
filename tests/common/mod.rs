//! Shared test support: a deterministic stand-in for the external move
//! rules and a line-oriented game file reader.
//!
//! `SimpleRules` plays a reduced game on the real board encoding: every
//! piece of the side to move may step one rank forward onto an empty
//! square, moves are written in coordinate form (`e2e3`), and FEN parsing
//! covers piece placement plus side to move. That is enough to exercise
//! fingerprinting, continuation expansion and SAN round-trips without a
//! chess engine.
//!
//! Game files are plain text, one game per line: `<result>;<moves...>`
//! with results `1-0`, `0-1`, `1/2-1/2` or `*` (unknown).

#![allow(dead_code)]

use std::path::Path;

use posdb::chess::{
    Color, Date, Eco, GameResult, Move, MoveRules, Piece, PieceType, Position, ReverseMove,
    Square,
};
use posdb::headers::GameMetadata;
use posdb::import::{Game, GameParseError, GameReader, GameReaderFactory};
use posdb::DatabaseOptions;

pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w";

pub struct SimpleRules;

impl SimpleRules {
    fn piece_from_fen_char(c: char) -> Option<Piece> {
        let color = if c.is_ascii_uppercase() {
            Color::White
        } else {
            Color::Black
        };
        let kind = match c.to_ascii_lowercase() {
            'p' => PieceType::Pawn,
            'n' => PieceType::Knight,
            'b' => PieceType::Bishop,
            'r' => PieceType::Rook,
            'q' => PieceType::Queen,
            'k' => PieceType::King,
            _ => return None,
        };
        Some(Piece::new(kind, color))
    }

    fn square_from_str(s: &str) -> Option<Square> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return None;
        }
        let file = bytes[0].checked_sub(b'a')?;
        let rank = bytes[1].checked_sub(b'1')?;
        (file < 8 && rank < 8).then(|| Square::new(file, rank))
    }
}

impl MoveRules for SimpleRules {
    fn legal_moves(&self, position: &Position) -> Vec<Move> {
        let side = position.side_to_move();
        let mut moves = Vec::new();
        for index in 0..64u8 {
            let from = Square::from_index(index);
            let piece = position.piece_at(from);
            if piece.is_none() || piece.color() != side {
                continue;
            }
            let to_rank = match side {
                Color::White if from.rank() < 7 => from.rank() + 1,
                Color::Black if from.rank() > 0 => from.rank() - 1,
                _ => continue,
            };
            let to = Square::new(from.file(), to_rank);
            if position.piece_at(to).is_none() {
                moves.push(Move::new(from, to));
            }
        }
        moves
    }

    fn make_move(&self, position: &Position, mv: Move) -> (Position, ReverseMove) {
        let mut next = *position;
        let moved = next.piece_at(mv.from);
        let captured = next.piece_at(mv.to).kind();
        next.set_piece(mv.from, Piece::NONE);
        next.set_piece(mv.to, moved);
        next.set_side_to_move(position.side_to_move().opposite());

        let reverse = ReverseMove {
            mv,
            captured,
            prev_castling: Default::default(),
            prev_en_passant_file: None,
        };
        (next, reverse)
    }

    fn san_to_move(&self, position: &Position, san: &str) -> Option<Move> {
        if san.len() != 4 || !san.is_ascii() {
            return None;
        }
        let from = Self::square_from_str(&san[0..2])?;
        let to = Self::square_from_str(&san[2..4])?;
        let mv = Move::new(from, to);
        self.legal_moves(position).contains(&mv).then_some(mv)
    }

    fn move_to_san(&self, _position: &Position, mv: Move) -> String {
        format!("{}{}", mv.from, mv.to)
    }

    fn position_from_fen(&self, fen: &str) -> Option<Position> {
        let mut parts = fen.split_whitespace();
        let placement = parts.next()?;
        let side = match parts.next() {
            Some("b") => Color::Black,
            Some("w") | None => Color::White,
            Some(_) => return None,
        };

        let mut pieces = [Piece::NONE.to_byte(); 64];
        let mut rank = 7u8;
        let mut file = 0u8;
        for c in placement.chars() {
            match c {
                '/' => {
                    if file != 8 || rank == 0 {
                        return None;
                    }
                    rank -= 1;
                    file = 0;
                }
                '1'..='8' => file += c as u8 - b'0',
                _ => {
                    let piece = Self::piece_from_fen_char(c)?;
                    if file >= 8 {
                        return None;
                    }
                    pieces[Square::new(file, rank).index()] = piece.to_byte();
                    file += 1;
                }
            }
        }
        (rank == 0 && file == 8).then(|| Position::new(pieces, side))
    }
}

fn parse_result(token: &str) -> Result<Option<GameResult>, GameParseError> {
    match token {
        "1-0" => Ok(Some(GameResult::WhiteWin)),
        "0-1" => Ok(Some(GameResult::BlackWin)),
        "1/2-1/2" => Ok(Some(GameResult::Draw)),
        "*" => Ok(None),
        other => Err(GameParseError(format!("bad result token {other:?}"))),
    }
}

/// Reads the line-oriented game files produced by [`write_games_file`].
pub struct LineGameFactory;

impl GameReaderFactory for LineGameFactory {
    fn open(&self, path: &Path) -> std::io::Result<Box<dyn GameReader>> {
        let text = std::fs::read_to_string(path)?;
        let tag = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Box::new(LineGameReader {
            lines: text
                .lines()
                .map(str::to_owned)
                .filter(|line| !line.trim().is_empty())
                .collect(),
            next: 0,
            tag,
        }))
    }
}

pub struct LineGameReader {
    lines: Vec<String>,
    next: usize,
    tag: String,
}

impl GameReader for LineGameReader {
    fn next_game(&mut self) -> Option<Result<Game, GameParseError>> {
        let line = self.lines.get(self.next)?.clone();
        let game_no = self.next;
        self.next += 1;
        Some(parse_game(&line, &self.tag, game_no))
    }
}

fn parse_game(line: &str, tag: &str, game_no: usize) -> Result<Game, GameParseError> {
    let rules = SimpleRules;
    let (result_token, moves_text) = line
        .split_once(';')
        .ok_or_else(|| GameParseError(format!("missing result separator in {line:?}")))?;
    let result = parse_result(result_token.trim())?;

    let mut plies = vec![(Position::initial(), None)];
    let mut position = Position::initial();
    for token in moves_text.split_whitespace() {
        let mv = rules
            .san_to_move(&position, token)
            .ok_or_else(|| GameParseError(format!("illegal move {token:?}")))?;
        let (next, reverse) = rules.make_move(&position, mv);
        plies.push((next, Some(reverse)));
        position = next;
    }

    let ply_count = (plies.len() - 1) as u16;
    let metadata = GameMetadata {
        date: Date {
            year: 2020,
            month: 6,
            day: 1,
        },
        eco: Eco {
            letter: b'A',
            index: 0,
        },
        ply_count,
        white_elo: 2400,
        black_elo: 2390,
        round: game_no as u16 + 1,
        event: format!("{tag} event"),
        white: format!("{tag} white {game_no}"),
        black: format!("{tag} black {game_no}"),
        extra_tags: Vec::new(),
    };

    Ok(Game {
        result,
        metadata,
        plies: Box::new(plies.into_iter()),
    })
}

/// Write one game per line; `games` pairs a result token with a move list.
pub fn write_games_file(path: &Path, games: &[(&str, &str)]) -> std::io::Result<()> {
    let mut text = String::new();
    for (result, moves) in games {
        text.push_str(result);
        text.push(';');
        text.push_str(moves);
        text.push('\n');
    }
    std::fs::write(path, text)
}

/// A ten-ply move list of alternating single pushes, legal from the start
/// position under [`SimpleRules`].
pub const TEN_PLIES: &str = "a2a3 a7a6 b2b3 b7b6 c2c3 c7c6 d2d3 d7d6 e2e3 e7e6";

pub fn small_options() -> DatabaseOptions {
    DatabaseOptions {
        import_memory: 64 * 1024,
        merge_memory: 64 * 1024,
        sort_workers: 2,
        import_workers: 1,
    }
}

/// Render a position back to the FEN subset [`SimpleRules`] parses.
pub fn fen_of(position: &Position) -> String {
    let mut out = String::new();
    for rank in (0..8).rev() {
        let mut empty = 0;
        for file in 0..8 {
            let piece = position.piece_at(Square::new(file, rank));
            if piece.is_none() {
                empty += 1;
                continue;
            }
            if empty > 0 {
                out.push(char::from(b'0' + empty));
                empty = 0;
            }
            let c = match piece.kind() {
                PieceType::Pawn => 'p',
                PieceType::Knight => 'n',
                PieceType::Bishop => 'b',
                PieceType::Rook => 'r',
                PieceType::Queen => 'q',
                PieceType::King => 'k',
                PieceType::None => unreachable!(),
            };
            out.push(if piece.color() == Color::White {
                c.to_ascii_uppercase()
            } else {
                c
            });
        }
        if empty > 0 {
            out.push(char::from(b'0' + empty));
        }
        if rank > 0 {
            out.push('/');
        }
    }
    out.push(' ');
    out.push(match position.side_to_move() {
        Color::White => 'w',
        Color::Black => 'b',
    });
    out
}
