use newt_msg::no_repeat::{BLOCK1, BLOCK2};
use newt_msg::{Block, Code, Id, Message, MessageOptions, Type};

use super::{Ctx, Effect, Layer, Signal};
use crate::error::{BlockwiseError, Failure};
use crate::exchange::{BlockState, Exchange};
use crate::net::Addrd;
use crate::resp::code;
use crate::time::{Clock, TimerEvent};

/// BLOCK1/BLOCK2 fragmentation & reassembly (RFC7959).
///
/// Outbound payloads larger than the configured block size are split;
/// inbound fragmented transfers are buffered in the exchange's
/// [`BlockState`] slot and handed up only once whole. Partial state
/// lives no longer than `blockwise_status_lifetime`.
///
/// The reassembly window is a strict size of 1: the only acceptable
/// next block is the one after the last, duplicates are dropped, and
/// anything further ahead is a gap (4.08 for BLOCK1, abort for
/// BLOCK2).
#[derive(Debug, Default, Clone, Copy)]
pub struct Blockwise;

fn ensure_state<C: Clock>(ctx: &mut Ctx<'_, C>, ex: &mut Exchange<C>) {
  if ex.block.is_none() {
    let st = BlockState::new(ctx.now, ctx.config.msg.block.status_lifetime);
    ctx.timers.schedule(st.expires_at,
                        TimerEvent::BlockwiseExpiry { addr: ex.addr,
                                                      token: ex.token() });
    ex.block = Some(st);
  }
}

fn drop_state<C: Clock>(ctx: &mut Ctx<'_, C>, ex: &mut Exchange<C>) {
  if ex.block.take().is_some() {
    let (addr, token) = (ex.addr, ex.token());
    ctx.timers.cancel(|ev| {
                 matches!(ev,
                          TimerEvent::BlockwiseExpiry { addr: a, token: t }
                          if *a == addr && *t == token)
               });
  }
}

/// A reply to `req`: piggybacked on the ACK when the request was
/// confirmable, non-confirmable (ID assigned at send) otherwise.
fn reply_to(req: &Message, code: Code) -> Message {
  match req.ty {
    | Type::Con => Message::new(Type::Ack, code, req.id, req.token),
    | _ => Message::new(Type::Non, code, Id(0), req.token),
  }
}

/// The block size to fragment with: the peer's preference when it
/// already told us one, never above our own configured preference.
fn tx_size<C: Clock>(ctx: &Ctx<'_, C>, ex: &Exchange<C>) -> u16 {
  let pref = ctx.config.msg.block.preferred_size;
  ex.block
    .as_ref()
    .and_then(|st| st.szx)
    .map(|szx| 2u16.pow(szx.min(6) + 4))
    .unwrap_or(pref)
    .min(pref)
}

impl<C: Clock> Layer<C> for Blockwise {
  fn send_request(&mut self,
                  ctx: &mut Ctx<'_, C>,
                  ex: &mut Exchange<C>,
                  msg: &mut Message)
                  -> Result<Signal, Failure> {
    let size = tx_size(ctx, ex);

    if msg.payload.0.len() > size as usize && msg.block1().is_none() {
      ensure_state(ctx, ex);
      let body = core::mem::take(&mut msg.payload.0);

      if let Some((chunk, more)) = BlockState::<C>::chunk(&body, size, 0) {
        msg.payload.0 = chunk.to_vec();
        msg.set_block1(Block::new(size, 0, more));
        msg.set_size1(body.len() as u32);
      }

      if let Some(st) = ex.block.as_mut() {
        st.szx = Some(Block::new(size, 0, false).szx());
        st.tx_body = Some(body);
      }
    }

    Ok(Signal::Continue)
  }

  fn send_response(&mut self,
                   ctx: &mut Ctx<'_, C>,
                   ex: &mut Exchange<C>,
                   msg: &mut Message)
                   -> Result<Signal, Failure> {
    let size = tx_size(ctx, ex);

    if msg.payload.0.len() > size as usize && msg.block2().is_none() {
      ensure_state(ctx, ex);
      let body = core::mem::take(&mut msg.payload.0);

      if let Some((chunk, more)) = BlockState::<C>::chunk(&body, size, 0) {
        msg.payload.0 = chunk.to_vec();
        msg.set_block2(Block::new(size, 0, more));
        msg.set_size2(body.len() as u32);
      }

      if let Some(st) = ex.block.as_mut() {
        st.szx = Some(Block::new(size, 0, false).szx());
        st.template = Some(Message { payload: Default::default(),
                                     ..msg.clone() });
        st.tx_body = Some(body);
      }
    }

    Ok(Signal::Continue)
  }

  fn receive_response(&mut self,
                      ctx: &mut Ctx<'_, C>,
                      ex: &mut Exchange<C>,
                      msg: &mut Message)
                      -> Result<Signal, Failure> {
    // 2.31: the server took our block and wants the next one
    if msg.code == code::CONTINUE {
      let body = ex.block.as_ref().and_then(|st| st.tx_body.clone());

      if let Some(body) = body {
        let size = msg.block1().map(|b| b.size()).unwrap_or_else(|| tx_size(ctx, ex));
        let next = msg.block1().map(|b| b.num() + 1).unwrap_or(0);

        if let Some((chunk, more)) = BlockState::<C>::chunk(&body, size, next) {
          let mut new = ex.request.clone();
          new.id = Id(0);
          new.payload.0 = chunk.to_vec();
          new.set_block1(Block::new(size, next, more));
          ex.request = new;

          ctx.effects.push(Effect::Transmit(Addrd(ex.token(), ex.addr)));
          return Ok(Signal::Stop);
        }
      }

      return Ok(Signal::Continue);
    }

    match msg.block2() {
      | Some(b2) => {
        if !b2.is_valid() {
          drop_state(ctx, ex);
          return Err(Failure::Blockwise(BlockwiseError::ReservedSzx));
        }

        ensure_state(ctx, ex);

        let (expected, szx) = match ex.block.as_ref() {
          | Some(st) => (st.next_num, st.szx),
          | None => (0, None),
        };

        if szx.map(|s| s != b2.szx()).unwrap_or(false) {
          drop_state(ctx, ex);
          return Err(Failure::Blockwise(BlockwiseError::SzxMismatch));
        }

        if b2.num() < expected {
          // a piece we already have
          return Ok(Signal::Stop);
        }

        if b2.num() > expected {
          drop_state(ctx, ex);
          return Err(Failure::Blockwise(BlockwiseError::Gap { expected,
                                                              got: b2.num() }));
        }

        if let Some(st) = ex.block.as_mut() {
          st.szx = Some(b2.szx());
          st.pieces.insert(b2.num(), msg.payload.0.clone());
          st.next_num = b2.num() + 1;
        }

        if b2.more() {
          // mirror the server's size on the follow-up (late
          // negotiation) and ask for the next piece
          let next = b2.num() + 1;
          let mut new = ex.request.clone();
          new.id = Id(0);
          new.payload.0 = Default::default();
          new.remove(BLOCK1);
          new.set_block2(Block::new(b2.size(), next, false));
          ex.request = new;

          ctx.effects.push(Effect::Transmit(Addrd(ex.token(), ex.addr)));
          Ok(Signal::Stop)
        } else {
          if let Some(st) = ex.block.as_ref() {
            msg.payload.0 = st.assembled();
          }
          msg.remove(BLOCK2);
          drop_state(ctx, ex);
          Ok(Signal::Continue)
        }
      },
      | None => {
        // an unfragmented response ends any transfer state
        drop_state(ctx, ex);
        Ok(Signal::Continue)
      },
    }
  }

  fn receive_request(&mut self,
                     ctx: &mut Ctx<'_, C>,
                     ex: &mut Exchange<C>,
                     msg: &mut Message)
                     -> Result<Signal, Failure> {
    if let Some(b1) = msg.block1() {
      if !b1.is_valid() {
        ctx.send(reply_to(msg, code::BAD_REQUEST), ex.addr);
        return Ok(Signal::Stop);
      }

      ensure_state(ctx, ex);

      let (expected, szx) = match ex.block.as_ref() {
        | Some(st) => (st.next_num, st.szx),
        | None => (0, None),
      };

      if szx.map(|s| s != b1.szx()).unwrap_or(false) || b1.num() > expected {
        drop_state(ctx, ex);
        ctx.send(reply_to(msg, code::REQUEST_ENTITY_INCOMPLETE), ex.addr);
        return Ok(Signal::Stop);
      }

      if b1.num() < expected {
        // a block we already took; re-encourage the sender
        let mut rep = reply_to(msg, code::CONTINUE);
        rep.set_block1(b1);
        ctx.send(rep, ex.addr);
        return Ok(Signal::Stop);
      }

      if let Some(st) = ex.block.as_mut() {
        st.szx = Some(b1.szx());
        st.pieces.insert(b1.num(), msg.payload.0.clone());
        st.next_num = b1.num() + 1;
      }

      if b1.more() {
        let mut rep = reply_to(msg, code::CONTINUE);
        rep.set_block1(Block::new(b1.size(), b1.num(), true));
        ctx.send(rep, ex.addr);
        return Ok(Signal::Stop);
      }

      if let Some(st) = ex.block.as_ref() {
        msg.payload.0 = st.assembled();
      }
      msg.remove(BLOCK1);
      drop_state(ctx, ex);
      return Ok(Signal::Continue);
    }

    if let Some(b2) = msg.block2() {
      if b2.num() == 0 {
        // early negotiation: the client told us its preferred size
        // before any response exists
        ensure_state(ctx, ex);
        if let Some(st) = ex.block.as_mut() {
          st.szx = Some(b2.szx().min(6));
        }
        return Ok(Signal::Continue);
      }

      // continuation of a fragmented response we are serving
      let served = ex.block
                     .as_ref()
                     .and_then(|st| st.tx_body.as_ref().map(|b| (b.clone(), st.template.clone())));

      return match served {
        | Some((body, template)) => {
          let size = b2.size().min(ctx.config.msg.block.preferred_size);

          match BlockState::<C>::chunk(&body, size, b2.num()) {
            | Some((chunk, more)) => {
              let mut rep = template.unwrap_or_else(|| reply_to(msg, code::CONTENT));
              rep.token = msg.token;
              match msg.ty {
                | Type::Con => {
                  rep.ty = Type::Ack;
                  rep.id = msg.id;
                },
                | _ => {
                  rep.ty = Type::Non;
                  rep.id = Id(0);
                },
              }
              rep.payload.0 = chunk.to_vec();
              rep.set_block2(Block::new(size, b2.num(), more));

              if !more {
                drop_state(ctx, ex);
              }

              ctx.send(rep, ex.addr);
              Ok(Signal::Stop)
            },
            | None => {
              ctx.send(reply_to(msg, code::REQUEST_ENTITY_INCOMPLETE), ex.addr);
              Ok(Signal::Stop)
            },
          }
        },
        | None => {
          ctx.send(reply_to(msg, code::REQUEST_ENTITY_INCOMPLETE), ex.addr);
          Ok(Signal::Stop)
        },
      };
    }

    Ok(Signal::Continue)
  }

  fn on_timer(&mut self,
              ctx: &mut Ctx<'_, C>,
              ex: &mut Exchange<C>,
              ev: &TimerEvent)
              -> Result<Signal, Failure> {
    match ev {
      | TimerEvent::BlockwiseExpiry { .. } => {
        let expired = ex.block
                        .as_ref()
                        .map(|st| ctx.now >= st.expires_at)
                        .unwrap_or(false);

        if expired {
          ex.block = None;
          if !ex.is_completed() && ex.origin == crate::exchange::Origin::Local {
            return Err(Failure::Blockwise(BlockwiseError::Expired));
          }
        }

        Ok(Signal::Stop)
      },
      | _ => Ok(Signal::Continue),
    }
  }
}

#[cfg(test)]
mod tests {
  use newt_msg::Token;
  use std_alloc::vec::Vec;

  use super::*;
  use crate::config::Config;
  use crate::exchange::Origin;
  use crate::test::{dummy_addr, ClockMock};
  use crate::time::Timers;

  fn ctx<'a>(now: u64,
             effects: &'a mut Vec<Effect>,
             timers: &'a mut Timers<ClockMock>)
             -> Ctx<'a, ClockMock> {
    Ctx { now: ClockMock::instant(now),
          config: Config::default(),
          effects,
          timers }
  }

  fn get(token: u8) -> Message {
    Message::new(Type::Con, Code::GET, Id(1), Token::from_bytes(&[token]))
  }

  #[test]
  fn big_request_payload_is_fragmented() {
    let mut effects = Vec::new();
    let mut timers = Timers::new();
    let mut c = ctx(0, &mut effects, &mut timers);

    let mut req = get(1);
    req.code = Code::POST;
    req.payload.0 = core::iter::repeat(7u8).take(1400).collect();

    let mut ex = Exchange::new(Origin::Local, dummy_addr(), req.clone(), c.now);
    Blockwise.send_request(&mut c, &mut ex, &mut req).unwrap();

    let b1 = req.block1().unwrap();
    assert_eq!((b1.num(), b1.more(), b1.size()), (0, true, 512));
    assert_eq!(req.payload.0.len(), 512);
    assert_eq!(req.size1(), Some(1400));
    assert_eq!(ex.block.as_ref().unwrap().tx_body.as_ref().unwrap().len(),
               1400);
  }

  #[test]
  fn continue_asks_for_next_block() {
    let mut effects = Vec::new();
    let mut timers = Timers::new();
    let mut c = ctx(0, &mut effects, &mut timers);

    let mut req = get(1);
    req.code = Code::POST;
    req.payload.0 = core::iter::repeat(7u8).take(1400).collect();
    let mut ex = Exchange::new(Origin::Local, dummy_addr(), req.clone(), c.now);
    Blockwise.send_request(&mut c, &mut ex, &mut req).unwrap();
    ex.request = req.clone();

    let mut cont = Message::new(Type::Ack, code::CONTINUE, Id(1), Token::from_bytes(&[1]));
    cont.set_block1(Block::new(512, 0, true));

    let out = Blockwise.receive_response(&mut c, &mut ex, &mut cont).unwrap();

    assert_eq!(out, Signal::Stop);
    assert_eq!(effects.iter().filter(|e| matches!(e, Effect::Transmit(_))).count(),
               1);
    let b1 = ex.request.block1().unwrap();
    assert_eq!((b1.num(), b1.more()), (1, true));
    assert_eq!(ex.request.payload.0.len(), 512);
  }

  #[test]
  fn block2_download_reassembles_in_order() {
    let mut effects = Vec::new();
    let mut timers = Timers::new();

    let body: Vec<u8> = (0..=255u8).cycle().take(1400).collect();
    let req = get(1);
    let mut ex = Exchange::new(Origin::Local, dummy_addr(), req.clone(), ClockMock::instant(0));

    for num in 0..2 {
      let mut c = ctx(num as u64, &mut effects, &mut timers);
      let mut rep = Message::new(Type::Ack, code::CONTENT, Id(1), Token::from_bytes(&[1]));
      rep.set_block2(Block::new(512, num, true));
      rep.payload.0 = body[num as usize * 512..(num as usize + 1) * 512].to_vec();

      assert_eq!(Blockwise.receive_response(&mut c, &mut ex, &mut rep).unwrap(),
                 Signal::Stop);
      assert_eq!(ex.request.block2().map(|b| b.num()), Some(num + 1));
    }

    let mut c = ctx(2, &mut effects, &mut timers);
    let mut last = Message::new(Type::Ack, code::CONTENT, Id(1), Token::from_bytes(&[1]));
    last.set_block2(Block::new(512, 2, false));
    last.payload.0 = body[1024..].to_vec();

    assert_eq!(Blockwise.receive_response(&mut c, &mut ex, &mut last).unwrap(),
               Signal::Continue);
    assert_eq!(last.payload.0, body);
    assert_eq!(last.block2(), None);
    assert!(ex.block.is_none());
  }

  #[test]
  fn block2_gap_aborts() {
    let mut effects = Vec::new();
    let mut timers = Timers::new();
    let mut c = ctx(0, &mut effects, &mut timers);

    let mut ex = Exchange::new(Origin::Local, dummy_addr(), get(1), c.now);

    let mut rep = Message::new(Type::Ack, code::CONTENT, Id(1), Token::from_bytes(&[1]));
    rep.set_block2(Block::new(512, 2, true));

    assert_eq!(Blockwise.receive_response(&mut c, &mut ex, &mut rep),
               Err(Failure::Blockwise(BlockwiseError::Gap { expected: 0,
                                                            got: 2 })));
  }

  #[test]
  fn block2_szx_change_aborts() {
    let mut effects = Vec::new();
    let mut timers = Timers::new();

    let mut ex = Exchange::new(Origin::Local, dummy_addr(), get(1), ClockMock::instant(0));

    let mut c = ctx(0, &mut effects, &mut timers);
    let mut rep = Message::new(Type::Ack, code::CONTENT, Id(1), Token::from_bytes(&[1]));
    rep.set_block2(Block::new(512, 0, true));
    rep.payload.0 = std_alloc::vec![0; 512];
    Blockwise.receive_response(&mut c, &mut ex, &mut rep).unwrap();

    let mut c = ctx(1, &mut effects, &mut timers);
    let mut rep = Message::new(Type::Ack, code::CONTENT, Id(2), Token::from_bytes(&[1]));
    rep.set_block2(Block::new(256, 1, true));
    rep.payload.0 = std_alloc::vec![0; 256];

    assert_eq!(Blockwise.receive_response(&mut c, &mut ex, &mut rep),
               Err(Failure::Blockwise(BlockwiseError::SzxMismatch)));
  }

  #[test]
  fn block1_upload_is_reassembled_with_continues() {
    let mut effects = Vec::new();
    let mut timers = Timers::new();

    let body: Vec<u8> = (0..=255u8).cycle().take(700).collect();
    let first = {
      let mut m = get(9);
      m.code = Code::PUT;
      m
    };
    let mut ex = Exchange::new(Origin::Remote, dummy_addr(), first.clone(), ClockMock::instant(0));

    // block 0 of 2
    let mut c = ctx(0, &mut effects, &mut timers);
    let mut req = first.clone();
    req.set_block1(Block::new(512, 0, true));
    req.payload.0 = body[..512].to_vec();

    assert_eq!(Blockwise.receive_request(&mut c, &mut ex, &mut req).unwrap(),
               Signal::Stop);
    match &effects[0] {
      | Effect::Send(Addrd(rep, _)) => {
        assert_eq!(rep.code, code::CONTINUE);
        assert_eq!(rep.block1().map(|b| b.num()), Some(0));
      },
      | e => panic!("expected Send, got {:?}", e),
    }

    // final block
    let mut c = ctx(1, &mut effects, &mut timers);
    let mut req = first.clone();
    req.id = Id(2);
    req.set_block1(Block::new(512, 1, false));
    req.payload.0 = body[512..].to_vec();

    assert_eq!(Blockwise.receive_request(&mut c, &mut ex, &mut req).unwrap(),
               Signal::Continue);
    assert_eq!(req.payload.0, body);
    assert_eq!(req.block1(), None);
  }

  #[test]
  fn block1_gap_gets_4_08() {
    let mut effects = Vec::new();
    let mut timers = Timers::new();
    let mut c = ctx(0, &mut effects, &mut timers);

    let mut ex = Exchange::new(Origin::Remote, dummy_addr(), get(9), c.now);

    let mut req = get(9);
    req.code = Code::PUT;
    req.set_block1(Block::new(512, 3, true));
    req.payload.0 = std_alloc::vec![0; 512];

    assert_eq!(Blockwise.receive_request(&mut c, &mut ex, &mut req).unwrap(),
               Signal::Stop);
    match &effects[0] {
      | Effect::Send(Addrd(rep, _)) => {
        assert_eq!(rep.code, code::REQUEST_ENTITY_INCOMPLETE)
      },
      | e => panic!("expected Send, got {:?}", e),
    }
  }

  #[test]
  fn big_response_is_fragmented_and_served_on_demand() {
    let mut effects = Vec::new();
    let mut timers = Timers::new();

    let body: Vec<u8> = (0..=255u8).cycle().take(1400).collect();
    let req = get(5);
    let mut ex = Exchange::new(Origin::Remote, dummy_addr(), req.clone(), ClockMock::instant(0));

    // the app responds with the whole body; the layer keeps the tail
    let mut c = ctx(0, &mut effects, &mut timers);
    let mut rep = Message::new(Type::Ack, code::CONTENT, Id(1), Token::from_bytes(&[5]));
    rep.payload.0 = body.clone();
    Blockwise.send_response(&mut c, &mut ex, &mut rep).unwrap();

    let b2 = rep.block2().unwrap();
    assert_eq!((b2.num(), b2.more(), b2.size()), (0, true, 512));
    assert_eq!(rep.payload.0, body[..512].to_vec());
    assert_eq!(rep.size2(), Some(1400));

    // the client asks for block 2
    let mut c = ctx(1, &mut effects, &mut timers);
    let mut cont = req.clone();
    cont.id = Id(40);
    cont.set_block2(Block::new(512, 2, false));

    assert_eq!(Blockwise.receive_request(&mut c, &mut ex, &mut cont).unwrap(),
               Signal::Stop);
    match effects.last().unwrap() {
      | Effect::Send(Addrd(rep, _)) => {
        assert_eq!(rep.payload.0, body[1024..].to_vec());
        let b2 = rep.block2().unwrap();
        assert_eq!((b2.num(), b2.more()), (2, false));
        assert_eq!(rep.id, Id(40));
      },
      | e => panic!("expected Send, got {:?}", e),
    }
  }
}
