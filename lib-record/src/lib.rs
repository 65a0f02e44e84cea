mod entry;
mod error;
mod literal;
mod wire;

pub use crate::{
    entry::{is_entry_start, read_entries, split_entry, type_code, Direction, Tag},
    error::{Error as RecordError, Result},
    literal::{parse_str_list, parse_str_map},
    wire::{Request, FIELD_SEP, STREAM_SEP, TERMINATE},
};
