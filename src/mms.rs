//! Publish/subscribe message bus.
//!
//! Topics are named; items are integer ids inside a topic. Publishing caches the item's
//! latest value on the topic and queues one [`Delivery`] per subscriber. The host drains
//! the queue with [`Bus::pop`] and dispatches each delivery to the component that owns
//! the subscriber id, which then reads whatever items it needs through
//! [`Bus::item_data`].

use heapless::{Deque, String, Vec};

use crate::fmt::*;
use crate::work::DelayedWork;

pub const MAX_TOPICS: usize = 8;
pub const MAX_SUBSCRIBERS: usize = 16;
pub const MAX_ITEMS: usize = 24;
pub const MAX_QUEUED: usize = 32;
/// Capacity of a string item
pub const STR_ITEM_LEN: usize = 1024;

/// Well-known topic names
pub mod topics {
    pub const GAUGE: &str = "gauge";
    pub const SUB_GAUGE: &str = "gauge:1";
    pub const WIRED: &str = "wired";
    pub const WIRELESS: &str = "wireless";
    pub const VOOC: &str = "vooc";
    pub const COMMON: &str = "common";
    pub const ERROR: &str = "error";
}

/// Item ids, grouped by the topic that carries them
pub mod items {
    pub const GAUGE_ITEM_SOC: u32 = 0;
    pub const GAUGE_ITEM_VOL_MIN: u32 = 1;
    pub const GAUGE_ITEM_CURR: u32 = 2;
    pub const GAUGE_ITEM_TEMP: u32 = 3;
    pub const GAUGE_ITEM_CC: u32 = 4;
    pub const GAUGE_ITEM_VBAT_UV: u32 = 5;
    pub const GAUGE_ITEM_FCC_COEFF: u32 = 6;
    pub const GAUGE_ITEM_SOH_COEFF: u32 = 7;
    pub const GAUGE_ITEM_DEEP_DISCHG_COUNT: u32 = 8;
    pub const GAUGE_ITEM_RATIO_VALUE: u32 = 9;
    pub const GAUGE_ITEM_SILI_IC_ALG_CFG: u32 = 10;
    pub const GAUGE_ITEM_SPARE_POWER_ENABLE: u32 = 11;
    pub const GAUGE_ITEM_REG_INFO: u32 = 12;

    pub const COMM_ITEM_UI_SOC: u32 = 0;
    pub const COMM_ITEM_SHELL_TEMP: u32 = 1;
    pub const COMM_ITEM_SUPER_ENDURANCE_STATUS: u32 = 2;

    pub const WIRED_ITEM_ONLINE: u32 = 0;
    pub const WIRED_ITEM_BYB_ID_INFO: u32 = 1;
    pub const WIRED_ITEM_BYB_ID_MATCH_INFO: u32 = 2;

    pub const WLS_ITEM_PRESENT: u32 = 0;

    pub const ERR_ITEM_DEEP_DISCHG_INFO: u32 = 0;
    pub const ERR_ITEM_CHGSTAT: u32 = 1;
    pub const ERR_ITEM_BATT_ID: u32 = 2;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    UnknownTopic,
    TooManyTopics,
    TooManySubscribers,
    TooManyItems,
    QueueFull,
    NoData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MsgType {
    Item,
    Timer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MsgPrio {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgData<'a> {
    None,
    Int(i32),
    Str(&'a str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Msg<'a> {
    pub kind: MsgType,
    pub prio: MsgPrio,
    pub item: u32,
    pub data: MsgData<'a>,
    pub sync: bool,
}

impl<'a> Msg<'a> {
    /// A change notification without payload
    pub fn item(prio: MsgPrio, item: u32) -> Self {
        Self {
            kind: MsgType::Item,
            prio,
            item,
            data: MsgData::None,
            sync: false,
        }
    }

    pub fn int(prio: MsgPrio, item: u32, value: i32) -> Self {
        Self {
            data: MsgData::Int(value),
            ..Self::item(prio, item)
        }
    }

    pub fn str(prio: MsgPrio, item: u32, value: &'a str) -> Self {
        Self {
            data: MsgData::Str(value),
            ..Self::item(prio, item)
        }
    }

    /// Marks the message as requiring synchronous handling by the receiver
    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TopicId(u8);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubscriberId(u16);

/// What a subscriber receives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Delivery {
    pub topic: TopicId,
    pub subscriber: SubscriberId,
    pub kind: MsgType,
    pub item: u32,
    pub sync: bool,
}

/// Cached item value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemData<'a> {
    Int(i32),
    Str(&'a str),
}

impl ItemData<'_> {
    pub fn int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Str(_) => None,
        }
    }
}

struct Topic {
    name: &'static str,
    subscribers: Vec<SubscriberId, MAX_SUBSCRIBERS>,
    ints: Vec<(u32, i32), MAX_ITEMS>,
    /// Only the latest string item is kept
    text: Option<(u32, String<STR_ITEM_LEN>)>,
    interval_ms: Option<u64>,
    timer: DelayedWork,
}

pub struct Bus {
    topics: Vec<Topic, MAX_TOPICS>,
    queue: Deque<Delivery, MAX_QUEUED>,
    next_subscriber: u16,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            topics: Vec::new(),
            queue: Deque::new(),
            next_subscriber: 0,
        }
    }

    /// Registers a topic. With `interval_ms` the topic emits a timer delivery to its
    /// subscribers at that period.
    pub fn register_topic(
        &mut self,
        name: &'static str,
        interval_ms: Option<u64>,
        now_ms: u64,
    ) -> Result<TopicId, BusError> {
        if let Some(id) = self.topic(name) {
            return Ok(id);
        }

        let mut timer = DelayedWork::new();
        if let Some(interval) = interval_ms {
            timer.schedule(now_ms, interval);
        }

        let id = TopicId(self.topics.len() as u8);
        self.topics
            .push(Topic {
                name,
                subscribers: Vec::new(),
                ints: Vec::new(),
                text: None,
                interval_ms,
                timer,
            })
            .map_err(|_| BusError::TooManyTopics)?;

        Ok(id)
    }

    pub fn topic(&self, name: &str) -> Option<TopicId> {
        self.topics
            .iter()
            .position(|t| t.name == name)
            .map(|i| TopicId(i as u8))
    }

    pub fn topic_name(&self, id: TopicId) -> Option<&'static str> {
        self.topics.get(id.0 as usize).map(|t| t.name)
    }

    fn get(&self, id: TopicId) -> Result<&Topic, BusError> {
        self.topics.get(id.0 as usize).ok_or(BusError::UnknownTopic)
    }

    fn get_mut(&mut self, id: TopicId) -> Result<&mut Topic, BusError> {
        self.topics
            .get_mut(id.0 as usize)
            .ok_or(BusError::UnknownTopic)
    }

    pub fn subscribe(&mut self, topic: TopicId) -> Result<SubscriberId, BusError> {
        let id = SubscriberId(self.next_subscriber);
        self.get_mut(topic)?
            .subscribers
            .push(id)
            .map_err(|_| BusError::TooManySubscribers)?;

        self.next_subscriber = self.next_subscriber.wrapping_add(1);
        Ok(id)
    }

    pub fn unsubscribe(&mut self, topic: TopicId, subscriber: SubscriberId) -> Result<(), BusError> {
        self.get_mut(topic)?.subscribers.retain(|s| *s != subscriber);
        Ok(())
    }

    fn enqueue(&mut self, delivery: Delivery, prio: MsgPrio) -> Result<(), BusError> {
        let pushed = if prio == MsgPrio::High {
            self.queue.push_front(delivery)
        } else {
            self.queue.push_back(delivery)
        };

        pushed.map_err(|_| BusError::QueueFull)
    }

    fn store(topic: &mut Topic, item: u32, data: MsgData<'_>) -> Result<(), BusError> {
        match data {
            MsgData::None => {}
            MsgData::Int(value) => match topic.ints.iter_mut().find(|(i, _)| *i == item) {
                Some(entry) => entry.1 = value,
                None => topic
                    .ints
                    .push((item, value))
                    .map_err(|_| BusError::TooManyItems)?,
            },
            MsgData::Str(value) => {
                let mut text = String::new();
                for c in value.chars() {
                    if text.push(c).is_err() {
                        break;
                    }
                }
                topic.text = Some((item, text));
            }
        }

        Ok(())
    }

    /// Caches the message data and queues it for every subscriber of the topic. If the
    /// queue can't take all of them nobody is notified, the cached value is still updated.
    pub fn publish(&mut self, topic: TopicId, msg: Msg<'_>) -> Result<(), BusError> {
        let entry = self.get_mut(topic)?;
        Self::store(entry, msg.item, msg.data)?;

        let subscribers = entry.subscribers.clone();
        if self.queue.capacity() - self.queue.len() < subscribers.len() {
            warn!("{}: drop item {} delivery", self.get(topic)?.name, msg.item);
            return Err(BusError::QueueFull);
        }

        for subscriber in subscribers {
            let delivery = Delivery {
                topic,
                subscriber,
                kind: msg.kind,
                item: msg.item,
                sync: msg.sync,
            };

            self.enqueue(delivery, msg.prio)?;
        }

        Ok(())
    }

    pub fn publish_to(&mut self, name: &str, msg: Msg<'_>) -> Result<(), BusError> {
        let topic = self.topic(name).ok_or(BusError::UnknownTopic)?;
        self.publish(topic, msg)
    }

    /// Updates the cached value of an item without notifying anyone
    pub fn set_item(&mut self, name: &str, item: u32, data: MsgData<'_>) -> Result<(), BusError> {
        let topic = self.topic(name).ok_or(BusError::UnknownTopic)?;
        Self::store(self.get_mut(topic)?, item, data)
    }

    pub fn item_data(&self, topic: TopicId, item: u32) -> Result<ItemData<'_>, BusError> {
        let topic = self.get(topic)?;

        if let Some((_, value)) = topic.ints.iter().find(|(i, _)| *i == item) {
            return Ok(ItemData::Int(*value));
        }

        match &topic.text {
            Some((i, text)) if *i == item => Ok(ItemData::Str(text.as_str())),
            _ => Err(BusError::NoData),
        }
    }

    /// Integer value of an item looked up by topic name
    pub fn item_int(&self, name: &str, item: u32) -> Result<i32, BusError> {
        let topic = self.topic(name).ok_or(BusError::UnknownTopic)?;
        self.item_data(topic, item)?
            .int()
            .ok_or(BusError::NoData)
    }

    pub fn pop(&mut self) -> Option<Delivery> {
        self.queue.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Emits timer deliveries for every topic whose update period elapsed
    pub fn tick(&mut self, now_ms: u64) {
        let mut due: Vec<TopicId, MAX_TOPICS> = Vec::new();

        for (i, topic) in self.topics.iter_mut().enumerate() {
            if let Some(interval) = topic.interval_ms {
                if topic.timer.take_due(now_ms) {
                    topic.timer.schedule(now_ms, interval);
                    let _ = due.push(TopicId(i as u8));
                }
            }
        }

        for topic in due {
            let msg = Msg {
                kind: MsgType::Timer,
                prio: MsgPrio::Low,
                item: 0,
                data: MsgData::None,
                sync: false,
            };

            if self.publish(topic, msg).is_err() {
                warn!("timer delivery dropped");
            }
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        crate::work::earliest(self.topics.iter().map(|t| &t.timer))
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
