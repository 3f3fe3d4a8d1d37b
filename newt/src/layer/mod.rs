use embedded_time::Instant;
use newt_msg::Message;
use no_std_net::SocketAddr;
use newt_msg::Token;
use std_alloc::boxed::Box;
use std_alloc::string::String;
use std_alloc::vec::Vec;

use crate::config::Config;
use crate::error::Failure;
use crate::exchange::Exchange;
use crate::net::Addrd;
use crate::time::{Clock, TimerEvent, Timers};

/// the retransmission & ACK/RST state machine for confirmable traffic
pub mod reliability;

/// BLOCK1/BLOCK2 fragmentation & reassembly
pub mod blockwise;

/// RFC7641 registration, freshness & notification scheduling
pub mod observe;

pub use blockwise::Blockwise;
pub use observe::Observe;
pub use reliability::Reliability;

/// Whether a message keeps travelling through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Signal {
  /// Hand the message to the next layer (or the application)
  Continue,
  /// The message was consumed here; nothing further happens
  Stop,
}

/// IO a layer would like performed once the traversal is over.
///
/// Layers never touch the socket themselves; they describe what
/// should happen and the endpoint makes it so. This keeps layers
/// deterministic and testable by asserting on the effects they
/// pushed.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
  /// Put a message on the wire as-is (ACKs, RSTs, block
  /// continuations). A message ID of 0 is replaced with a freshly
  /// allocated one at execution time.
  Send(Addrd<Message>),
  /// Run the full send pipeline for the exchange's current request
  /// again (block-wise follow-ups, observe re-registration), so the
  /// new transmission gets its own ID and reliability tracking.
  Transmit(Addrd<Token>),
  /// Flush the exchange's stashed notification through the response
  /// pipeline (used once the in-transit notification is confirmed).
  Notify(Addrd<Token>),
  /// Say something
  Log(log::Level, String),
}

/// Everything a layer may consult or mutate besides the exchange
/// and message themselves.
///
/// Notably absent: the exchange store. Index maintenance stays with
/// the endpoint so that a layer can never invalidate the handle it
/// is being called through.
#[derive(Debug)]
pub struct Ctx<'a, C: Clock> {
  /// The current time
  pub now: Instant<C>,
  /// The endpoint's configuration
  pub config: Config,
  /// Effects accumulated this traversal
  pub effects: &'a mut Vec<Effect>,
  /// The endpoint's timer queue
  pub timers: &'a mut Timers<C>,
}

impl<'a, C: Clock> Ctx<'a, C> {
  /// Queue a log line
  pub fn log(&mut self, level: log::Level, msg: String) {
    self.effects.push(Effect::Log(level, msg));
  }

  /// Queue a raw send
  pub fn send(&mut self, msg: Message, addr: SocketAddr) {
    self.effects.push(Effect::Send(Addrd(msg, addr)));
  }
}

/// One stage of the exchange pipeline.
///
/// Six entry points, one per direction and message role; each
/// defaults to passing the message along untouched, so a layer
/// implements only the flows it participates in. A seventh entry
/// point receives due timer events.
///
/// Returning `Err` terminates the exchange with that failure.
pub trait Layer<C: Clock>: core::fmt::Debug {
  /// An outgoing request is about to hit the wire
  fn send_request(&mut self,
                  ctx: &mut Ctx<'_, C>,
                  ex: &mut Exchange<C>,
                  msg: &mut Message)
                  -> Result<Signal, Failure> {
    let _ = (ctx, ex, msg);
    Ok(Signal::Continue)
  }

  /// An outgoing response is about to hit the wire
  fn send_response(&mut self,
                   ctx: &mut Ctx<'_, C>,
                   ex: &mut Exchange<C>,
                   msg: &mut Message)
                   -> Result<Signal, Failure> {
    let _ = (ctx, ex, msg);
    Ok(Signal::Continue)
  }

  /// An outgoing empty message (ping) is about to hit the wire
  fn send_empty(&mut self,
                ctx: &mut Ctx<'_, C>,
                ex: &mut Exchange<C>,
                msg: &mut Message)
                -> Result<Signal, Failure> {
    let _ = (ctx, ex, msg);
    Ok(Signal::Continue)
  }

  /// A request arrived from a peer
  fn receive_request(&mut self,
                     ctx: &mut Ctx<'_, C>,
                     ex: &mut Exchange<C>,
                     msg: &mut Message)
                     -> Result<Signal, Failure> {
    let _ = (ctx, ex, msg);
    Ok(Signal::Continue)
  }

  /// A response arrived for one of our exchanges
  fn receive_response(&mut self,
                      ctx: &mut Ctx<'_, C>,
                      ex: &mut Exchange<C>,
                      msg: &mut Message)
                      -> Result<Signal, Failure> {
    let _ = (ctx, ex, msg);
    Ok(Signal::Continue)
  }

  /// An ACK or RST arrived for one of our exchanges
  fn receive_empty(&mut self,
                   ctx: &mut Ctx<'_, C>,
                   ex: &mut Exchange<C>,
                   msg: &mut Message)
                   -> Result<Signal, Failure> {
    let _ = (ctx, ex, msg);
    Ok(Signal::Continue)
  }

  /// A timer entry belonging to this exchange fired
  fn on_timer(&mut self,
              ctx: &mut Ctx<'_, C>,
              ex: &mut Exchange<C>,
              ev: &TimerEvent)
              -> Result<Signal, Failure> {
    let _ = (ctx, ex, ev);
    Ok(Signal::Continue)
  }
}

macro_rules! traverse {
  (down $name:ident($msg_ty:ty)) => {
    /// Run this flow through the stack, application side first
    pub fn $name(&mut self,
                 ctx: &mut Ctx<'_, C>,
                 ex: &mut Exchange<C>,
                 msg: $msg_ty)
                 -> Result<Signal, Failure> {
      for layer in self.layers.iter_mut() {
        if let Signal::Stop = layer.$name(ctx, ex, msg)? {
          return Ok(Signal::Stop);
        }
      }
      Ok(Signal::Continue)
    }
  };
  (up $name:ident($msg_ty:ty)) => {
    /// Run this flow through the stack, wire side first
    pub fn $name(&mut self,
                 ctx: &mut Ctx<'_, C>,
                 ex: &mut Exchange<C>,
                 msg: $msg_ty)
                 -> Result<Signal, Failure> {
      for layer in self.layers.iter_mut().rev() {
        if let Signal::Stop = layer.$name(ctx, ex, msg)? {
          return Ok(Signal::Stop);
        }
      }
      Ok(Signal::Continue)
    }
  };
}

/// The ordered layer list.
///
/// ```text
/// App ──► [Observe] ──► [Blockwise] ──► [Reliability] ──► wire
/// App ◄── [Observe] ◄── [Blockwise] ◄── [Reliability] ◄── wire
/// ```
///
/// The driver (not the layers) owns the traversal position; layers
/// know nothing about their neighbors.
#[derive(Debug)]
pub struct Stack<C: Clock> {
  layers: Vec<Box<dyn Layer<C>>>,
}

impl<C: Clock + 'static> Default for Stack<C> {
  fn default() -> Self {
    Self::new()
  }
}

impl<C: Clock + 'static> Stack<C> {
  /// The standard observe/block-wise/reliability stack
  pub fn new() -> Self {
    let layers: Vec<Box<dyn Layer<C>>> =
      std_alloc::vec![Box::new(Observe), Box::new(Blockwise), Box::new(Reliability)];
    Self { layers }
  }
}

impl<C: Clock> Stack<C> {
  traverse!(down send_request(&mut Message));
  traverse!(down send_response(&mut Message));
  traverse!(down send_empty(&mut Message));
  traverse!(up receive_request(&mut Message));
  traverse!(up receive_response(&mut Message));
  traverse!(up receive_empty(&mut Message));
  traverse!(down on_timer(&TimerEvent));
}
