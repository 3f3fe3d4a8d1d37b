use newt_msg::{Id, Message, Type};
use std_alloc::format;

use super::{Ctx, Layer, Signal};
use crate::error::Failure;
use crate::exchange::{ConState, Exchange, Origin};
use crate::retry::{RetryTimer, YouShould};
use crate::time::{Clock, TimerEvent};

/// The RFC7252 retransmission state machine.
///
/// Outbound confirmable messages get a retransmission timer; incoming
/// ACKs and RSTs resolve it. Incoming confirmable traffic is
/// acknowledged here so upper layers never think about ACKs.
///
/// State lives in the exchange's [`ConState`] slot; this layer itself
/// is stateless.
#[derive(Debug, Default, Clone, Copy)]
pub struct Reliability;

/// Start (or restart) retransmission tracking for an outbound
/// message on this exchange.
///
/// No-op for non-confirmable messages. Also used by the observe
/// layer when it swaps a fresher notification into an in-transit
/// slot.
pub(crate) fn track<C: Clock>(ctx: &mut Ctx<'_, C>, ex: &mut Exchange<C>, msg: &Message) {
  match msg.ty {
    | Type::Con => {
      let timer = RetryTimer::new(ctx.now,
                                  ctx.config.msg.con.retry_strategy(),
                                  ctx.config.msg.con.max_attempts());

      ctx.timers.schedule(timer.next_due_at(),
                          TimerEvent::Retransmit { addr: ex.addr,
                                                   id: msg.id });

      ex.con = Some(ConState::InTransit { timer,
                                          transmissions: 1 });
    },
    | _ => (),
  }
}

/// Forget any in-flight CON state (a response arrived, or the
/// exchange died some other way), cancelling its timer entries.
fn settle<C: Clock>(ctx: &mut Ctx<'_, C>, ex: &mut Exchange<C>, outcome: ConState<C>) {
  let addr = ex.addr;
  let ids = [Some(ex.request.id), ex.response.as_ref().map(|m| m.id)];

  ctx.timers.cancel(|ev| {
               matches!(ev,
                        TimerEvent::Retransmit { addr: a, id }
                        if *a == addr && ids.contains(&Some(*id)))
             });
  ex.con = Some(outcome);
}

/// The message this exchange would retransmit: the request for
/// exchanges we started, the (cached) response for ones a peer did.
fn in_flight<C: Clock>(ex: &Exchange<C>) -> Option<Message> {
  match ex.origin {
    | Origin::Local => Some(ex.request.clone()),
    | Origin::Remote => ex.response.clone(),
  }
}

impl<C: Clock> Layer<C> for Reliability {
  fn send_request(&mut self,
                  ctx: &mut Ctx<'_, C>,
                  ex: &mut Exchange<C>,
                  msg: &mut Message)
                  -> Result<Signal, Failure> {
    track(ctx, ex, msg);
    Ok(Signal::Continue)
  }

  fn send_response(&mut self,
                   ctx: &mut Ctx<'_, C>,
                   ex: &mut Exchange<C>,
                   msg: &mut Message)
                   -> Result<Signal, Failure> {
    track(ctx, ex, msg);
    Ok(Signal::Continue)
  }

  fn send_empty(&mut self,
                ctx: &mut Ctx<'_, C>,
                ex: &mut Exchange<C>,
                msg: &mut Message)
                -> Result<Signal, Failure> {
    track(ctx, ex, msg);
    Ok(Signal::Continue)
  }

  fn receive_response(&mut self,
                      ctx: &mut Ctx<'_, C>,
                      ex: &mut Exchange<C>,
                      msg: &mut Message)
                      -> Result<Signal, Failure> {
    // any response settles the request's CON state; a piggybacked
    // ACK additionally confirms it explicitly
    if let Some(ConState::InTransit { .. }) = ex.con {
      settle(ctx, ex, ConState::Acknowledged);
      ex.watch.acknowledged();
    }

    // a separate confirmable response must itself be confirmed
    if msg.ty == Type::Con {
      ctx.send(msg.ack(), ex.addr);
    }

    Ok(Signal::Continue)
  }

  fn receive_empty(&mut self,
                   ctx: &mut Ctx<'_, C>,
                   ex: &mut Exchange<C>,
                   msg: &mut Message)
                   -> Result<Signal, Failure> {
    match msg.ty {
      | Type::Ack => {
        if let Some(ConState::InTransit { .. }) = ex.con {
          settle(ctx, ex, ConState::Acknowledged);
          ex.watch.acknowledged();
        }
        Ok(Signal::Continue)
      },
      | Type::Reset if ex.origin == Origin::Local && ex.request.is_empty_code() => {
        // CoAP ping: the RST is the pong
        settle(ctx, ex, ConState::Acknowledged);
        ex.ready.push(msg.clone());
        ex.complete(ctx.now, Ok(()));
        Ok(Signal::Stop)
      },
      | Type::Reset => {
        settle(ctx, ex, ConState::Rejected);
        ex.watch.rejected();
        ex.complete(ctx.now, Err(Failure::Rejected));
        Ok(Signal::Continue)
      },
      | _ => Ok(Signal::Continue),
    }
  }

  fn on_timer(&mut self,
              ctx: &mut Ctx<'_, C>,
              ex: &mut Exchange<C>,
              ev: &TimerEvent)
              -> Result<Signal, Failure> {
    let id = match ev {
      | TimerEvent::Retransmit { id, .. } => *id,
      | _ => return Ok(Signal::Continue),
    };

    let (mut timer, transmissions) = match ex.con {
      | Some(ConState::InTransit { timer, transmissions }) => (timer, transmissions),
      | _ => return Ok(Signal::Stop), // already settled; stale entry
    };

    if in_flight(ex).map(|m| m.id) != Some(id) {
      // entry for an ID this exchange moved past
      return Ok(Signal::Stop);
    }

    match timer.what_should_i_do(ctx.now) {
      | Err(nb::Error::WouldBlock) => {
        // a replaced timer; fall back to its own schedule
        ctx.timers.schedule(timer.next_due_at(),
                            TimerEvent::Retransmit { addr: ex.addr, id });
        ex.con = Some(ConState::InTransit { timer, transmissions });
      },
      | Ok(YouShould::Retry) => {
        let transmissions = transmissions + 1;
        ex.watch.retransmitting(transmissions);

        if let Some(msg) = in_flight(ex) {
          ctx.log(log::Level::Debug,
                  format!("{:?} retransmitting {:?} (attempt {})",
                          ex.addr,
                          id,
                          transmissions));
          ctx.send(msg, ex.addr);
        }

        ctx.timers.schedule(timer.next_due_at(),
                            TimerEvent::Retransmit { addr: ex.addr, id });
        ex.con = Some(ConState::InTransit { timer, transmissions });
      },
      | Ok(YouShould::Cry) => {
        settle(ctx, ex, ConState::TimedOut);
        ex.watch.timed_out();
        ex.complete(ctx.now, Err(Failure::Timeout));
      },
    }

    Ok(Signal::Stop)
  }
}
