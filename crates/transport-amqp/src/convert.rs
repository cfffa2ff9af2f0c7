//! Conversions between contract types and `lapin` types.

use courier_transport::{ArgumentValue, Arguments, ExchangeKind, MessageProperties};
use lapin::BasicProperties;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};

const PERSISTENT: u8 = 2;

pub fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

pub fn field_table(arguments: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = match value {
            ArgumentValue::Bool(flag) => AMQPValue::Boolean(*flag),
            ArgumentValue::Int(number) => AMQPValue::LongLongInt(*number),
            ArgumentValue::Text(text) => AMQPValue::LongString(LongString::from(text.as_str())),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}

pub fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(kind) = &properties.kind {
        basic = basic.with_kind(ShortString::from(kind.as_str()));
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT);
    }
    basic
}

pub fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        correlation_id: basic
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: basic.reply_to().as_ref().map(|to| to.as_str().to_string()),
        kind: basic.kind().as_ref().map(|kind| kind.as_str().to_string()),
        persistent: *basic.delivery_mode() == Some(PERSISTENT),
        mandatory: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_survive_a_trip_through_lapin() {
        let properties = MessageProperties {
            correlation_id: Some("abc".to_string()),
            reply_to: Some("amq.gen-1".to_string()),
            kind: Some("status".to_string()),
            persistent: true,
            mandatory: false,
        };

        let basic = to_basic_properties(&properties);
        assert_eq!(*basic.delivery_mode(), Some(2));
        assert_eq!(from_basic_properties(&basic), properties);
    }

    #[test]
    fn empty_properties_stay_empty() {
        let basic = to_basic_properties(&MessageProperties::default());
        assert_eq!(from_basic_properties(&basic), MessageProperties::default());
    }

    #[test]
    fn arguments_map_to_amqp_values() {
        let mut arguments = Arguments::new();
        arguments.insert("x-message-ttl".to_string(), ArgumentValue::Int(1000));
        arguments.insert("x-single-active-consumer".to_string(), ArgumentValue::Bool(true));

        let table = field_table(&arguments);
        let inner = table.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(1000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-single-active-consumer")),
            Some(&AMQPValue::Boolean(true))
        );
    }
}
