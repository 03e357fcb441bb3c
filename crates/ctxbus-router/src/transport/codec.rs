//! Decode-once codec between WebSocket messages and frames.
//!
//! - Text (and UTF-8 binary) messages => `Frame`
//! - Ping/Pong are surfaced so pumps can ignore them
//! - Close ends the connection

use axum::extract::ws::Message as AxumMessage;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use ctxbus_core::error::{Result, RouteError};
use ctxbus_core::Frame;

#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    Control,
    Close,
}

fn decode_binary(b: Vec<u8>) -> Result<Inbound> {
    let s = String::from_utf8(b)
        .map_err(|e| RouteError::Malformed(format!("binary frame is not utf-8: {e}")))?;
    Frame::from_text(&s).map(Inbound::Frame)
}

/// Hub side (axum).
pub fn decode_server(msg: AxumMessage) -> Result<Inbound> {
    match msg {
        AxumMessage::Text(s) => Frame::from_text(&s).map(Inbound::Frame),
        AxumMessage::Binary(b) => decode_binary(b),
        AxumMessage::Ping(_) | AxumMessage::Pong(_) => Ok(Inbound::Control),
        AxumMessage::Close(_) => Ok(Inbound::Close),
    }
}

pub fn encode_server(frame: &Frame) -> Result<AxumMessage> {
    frame.to_text().map(AxumMessage::Text)
}

/// Satellite side (tungstenite).
pub fn decode_client(msg: WsMessage) -> Result<Inbound> {
    match msg {
        WsMessage::Text(s) => Frame::from_text(&s).map(Inbound::Frame),
        WsMessage::Binary(b) => decode_binary(b),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(Inbound::Control),
        WsMessage::Close(_) => Ok(Inbound::Close),
    }
}

pub fn encode_client(frame: &Frame) -> Result<WsMessage> {
    frame.to_text().map(WsMessage::Text)
}
