//! Test doubles standing in for the card's serial consoles.
pub mod menu;
pub mod serial;
