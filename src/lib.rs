/*!
# An HL7 v2 over MLLP interface engine for clinical lab analyzers.

 Analyzers open a TCP connection and push HL7 v2 result messages (`ORU^R01`), each wrapped in an MLLP
 frame (`0x0B` … `0x1C 0x0D`). For every frame this crate:

 1. archives the exact message text through a [`RawMessageStore`],
 2. parses patient, order and observation data into a [`ParsedObservationMessage`],
 3. saves it through an [`ObservationRepository`], one row per observation,
 4. answers with a framed HL7 acknowledgment: `AA` when saved, `AE` with the reason otherwise.

 A bad message or a database outage only ever fails that one message; the connection stays open and
 the analyzer gets an `AE` acknowledgment it can act on.

 The pieces can be used on their own: [`Framer`] is a plain byte-to-message state machine,
 [`MllpCodec`] adapts it to a tokio [Codec](https://docs.rs/tokio-util/0.7/tokio_util/codec/index.html),
 and [`ObservationParser`] turns message text into the domain model without touching the network.

 ## Example
 ```no_run
use std::sync::Arc;

use analyzer_logger::{
    AckBuilder, FileRawMessageStore, Listener, ListenerOptions, Pipeline, Settings,
    SqlObservationRepository,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load("analyzer-logger.toml".as_ref(), true)?;

    let raw_store = FileRawMessageStore::create(&settings.raw_store.directory).await?;
    let repository = SqlObservationRepository::connect_lazy(&settings.sql)?;
    let pipeline = Pipeline::new(
        Arc::new(raw_store),
        Arc::new(repository),
        AckBuilder::from(&settings.ack),
    );

    let listener = Listener::bind(
        settings.listener.socket_addr()?,
        settings.listener.backlog,
        ListenerOptions::default(),
        Arc::new(pipeline),
    )?;
    listener.run().await?; // until Ctrl+C
    Ok(())
}
```

 ## Framing quirk
 By default every `0x0D` byte is dropped by the framer, including the ones separating segments inside a
 message. The HL7 grammar copes by splitting single-line payloads in front of known segment ids. Set
 `framing.terminator_policy = "strip_outside_frame"` to keep in-frame terminators instead.
 */

pub mod ack;
pub mod codec;
pub mod config;
pub mod error;
pub mod hl7;
pub mod listener;
pub mod mllp;
pub mod model;
pub mod parser;
pub mod session;
pub mod storage;
pub mod timestamp;

pub use ack::{AckBuilder, AckOutcome};
pub use codec::MllpCodec;
pub use crate::config::Settings;
pub use error::{
    ConfigError, ConnectionError, ParseError, ProcessError, ServerError, StorageError,
};
pub use listener::{BackoffConfig, Listener, ListenerOptions};
pub use mllp::{Framer, TerminatorPolicy};
pub use model::{ObservationRecord, ParsedObservationMessage};
pub use parser::ObservationParser;
pub use session::{Pipeline, Session, SessionOptions};
pub use storage::{
    FileRawMessageStore, ObservationRepository, RawMessageStore, SqlObservationRepository,
};
