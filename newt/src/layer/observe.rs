use embedded_time::duration::Milliseconds;
use newt_msg::opt::known::observe::Action;
use newt_msg::{Message, MessageOptions, Type};
use std_alloc::format;

use super::{Ctx, Effect, Layer, Signal};
use crate::error::Failure;
use crate::exchange::{ConState, Exchange, Origin, Relation};
use crate::net::Addrd;
use crate::time::{Clock, TimerEvent};

/// RFC7641 resource observation, both halves:
///
/// As a client, a GET with Observe=0 establishes a relation; incoming
/// notifications are filtered by the freshness rule and a
/// re-registration timer re-GETs (reusing the token) when the
/// resource goes quiet past its Max-Age.
///
/// As a server, at most one confirmable notification is in transit
/// per relation. A fresher notification produced meanwhile waits in
/// the relation's stash, replacing any earlier stash; it goes out
/// when the in-transit one is confirmed, or takes over its message
/// ID when a retransmission comes due.
#[derive(Debug, Default, Clone, Copy)]
pub struct Observe;

fn cancel_rereg<C: Clock>(ctx: &mut Ctx<'_, C>, ex: &mut Exchange<C>) {
  let (addr, token) = (ex.addr, ex.token());
  ctx.timers.cancel(|ev| {
               matches!(ev,
                        TimerEvent::Reregister { addr: a, token: t }
                        if *a == addr && *t == token)
             });
  ex.reregister_at = None;
}

impl<C: Clock> Layer<C> for Observe {
  fn send_request(&mut self,
                  ctx: &mut Ctx<'_, C>,
                  ex: &mut Exchange<C>,
                  msg: &mut Message)
                  -> Result<Signal, Failure> {
    match msg.observe_action() {
      | Some(Action::Register) if ex.relation.is_none() => {
        ex.relation = Some(Relation::new(ctx.now));
      },
      | Some(Action::Deregister) => {
        if let Some(rel) = ex.relation.as_mut() {
          rel.cancelled = true;
        }
        cancel_rereg(ctx, ex);
      },
      | _ => (),
    }

    Ok(Signal::Continue)
  }

  fn receive_request(&mut self,
                     ctx: &mut Ctx<'_, C>,
                     ex: &mut Exchange<C>,
                     msg: &mut Message)
                     -> Result<Signal, Failure> {
    match msg.observe_action() {
      | Some(Action::Register) if ex.relation.is_none() => {
        ex.relation = Some(Relation::new(ctx.now));
      },
      | Some(Action::Deregister) => {
        ex.relation = None;
        ctx.log(log::Level::Debug,
                format!("{:?} deregistered {:?}", ex.addr, msg.token));
      },
      | _ => (),
    }

    Ok(Signal::Continue)
  }

  fn receive_response(&mut self,
                      ctx: &mut Ctx<'_, C>,
                      ex: &mut Exchange<C>,
                      msg: &mut Message)
                      -> Result<Signal, Failure> {
    if ex.relation.is_none() {
      return Ok(Signal::Continue);
    }

    if msg.code.is_error() {
      // the server ended the relation with an error; deliver it and
      // let the exchange complete
      ex.relation = None;
      cancel_rereg(ctx, ex);
      return Ok(Signal::Continue);
    }

    match msg.observe() {
      | Some(v) => {
        let stale = ex.relation
                      .as_ref()
                      .map(|rel| !rel.fresher(v, ctx.now))
                      .unwrap_or(true);

        if stale {
          ctx.log(log::Level::Debug,
                  format!("{:?} dropping stale notification {}", ex.addr, v));
          return Ok(Signal::Stop);
        }

        if let Some(rel) = ex.relation.as_mut() {
          rel.established = true;
          rel.last_counter = Some(v);
          rel.last_at = ctx.now;
        }

        // when the representation expires and nothing fresher has
        // arrived, interest is re-registered with the same token
        let max_age_ms = msg.max_age()
                            .map(|secs| secs as u64 * 1_000)
                            .unwrap_or(ctx.config.observe.notification_max_age.0);
        let due = ctx.now
                  + Milliseconds(max_age_ms + ctx.config.observe.reregistration_backoff.0);

        cancel_rereg(ctx, ex);
        ex.reregister_at = Some(due);
        ctx.timers.schedule(due,
                            TimerEvent::Reregister { addr: ex.addr,
                                                     token: msg.token });

        Ok(Signal::Continue)
      },
      | None => {
        // a response without Observe ends the relation (the server
        // declined or dropped it)
        ex.relation = None;
        cancel_rereg(ctx, ex);
        Ok(Signal::Continue)
      },
    }
  }

  fn receive_empty(&mut self,
                   ctx: &mut Ctx<'_, C>,
                   ex: &mut Exchange<C>,
                   msg: &mut Message)
                   -> Result<Signal, Failure> {
    if ex.relation.is_none() {
      return Ok(Signal::Continue);
    }

    let (addr, token) = (ex.addr, ex.token());

    match msg.ty {
      | Type::Ack => {
        let confirmed = ex.relation
                          .as_ref()
                          .map(|rel| rel.in_transit == Some(msg.id))
                          .unwrap_or(false);

        if confirmed {
          if let Some(rel) = ex.relation.as_mut() {
            rel.in_transit = None;

            if rel.next_notification.is_some() {
              // the confirmed slot frees up; flush the stash with a
              // new ID
              ctx.effects.push(Effect::Notify(Addrd(token, addr)));
            }
          }
        }
        Ok(Signal::Continue)
      },
      | Type::Reset => {
        // the peer rejected a notification: it no longer cares
        ex.relation = None;
        cancel_rereg(ctx, ex);
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
    match ev {
      | TimerEvent::Reregister { .. } => {
        let due = match (ex.observing(), ex.reregister_at) {
          | (true, Some(due)) if ctx.now >= due => true,
          | _ => false,
        };

        if due {
          ex.reregister_at = None;
          ex.request.set_observe(Action::Register);
          ex.request.id = newt_msg::Id(0);
          ex.watch.reregistering();
          ctx.effects.push(Effect::Transmit(Addrd(ex.token(), ex.addr)));
        }

        Ok(Signal::Stop)
      },
      | TimerEvent::Retransmit { id, .. } => {
        // a confirmable notification is due for retransmission; if a
        // fresher one is waiting, it goes out instead, reusing the
        // ID (and the confirmable slot)
        let swap = match (ex.origin, ex.relation.as_ref()) {
          | (Origin::Remote, Some(rel)) => {
            rel.in_transit == Some(*id)
            && rel.next_notification.is_some()
            && matches!(ex.con, Some(ConState::InTransit { .. }))
          },
          | _ => false,
        };

        if !swap {
          return Ok(Signal::Continue);
        }

        let stash = ex.relation
                      .as_mut()
                      .and_then(|rel| rel.next_notification.take());

        if let Some(mut fresher) = stash {
          fresher.id = *id;
          fresher.ty = Type::Con;
          fresher.token = ex.token();

          if let Some(rel) = ex.relation.as_mut() {
            rel.in_transit = Some(*id);
          }

          ex.response = Some(fresher.clone());
          super::reliability::track(ctx, ex, &fresher);
          ctx.send(fresher, ex.addr);
        }

        Ok(Signal::Stop)
      },
      | _ => Ok(Signal::Continue),
    }
  }
}
