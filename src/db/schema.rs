//! Store schema bootstrap
//!
//! Four primary tables (orders, order_slices, order_slice_executions,
//! order_slice_broker_events), each with a sibling `*_history` table fed by
//! an AFTER INSERT/UPDATE/DELETE trigger. The triggers are the only source of
//! truth for "who changed what, when"; recovery and debugging queries depend
//! on the history rows.
//!
//! Every statement here is idempotent so the bootstrap can run on each
//! startup: `CREATE TABLE IF NOT EXISTS`, `CREATE OR REPLACE FUNCTION`, and
//! `DROP TRIGGER IF EXISTS` before `CREATE TRIGGER`.

use sqlx::PgPool;

const CREATE_ORDERS: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id VARCHAR(64) PRIMARY KEY,
    instrument VARCHAR(50) NOT NULL,
    side VARCHAR(10) NOT NULL CHECK (side IN ('BUY', 'SELL')),
    total_quantity INTEGER NOT NULL CHECK (total_quantity > 0),
    num_splits INTEGER NOT NULL CHECK (num_splits > 0),
    duration_minutes INTEGER NOT NULL CHECK (duration_minutes > 0),
    randomize BOOLEAN NOT NULL DEFAULT FALSE,
    order_unique_key VARCHAR(255) NOT NULL UNIQUE,
    queue_status VARCHAR(20) NOT NULL DEFAULT 'PENDING'
        CHECK (queue_status IN ('PENDING', 'IN_PROGRESS', 'COMPLETED', 'FAILED', 'SKIPPED')),
    skip_reason TEXT,
    split_completed_at TIMESTAMPTZ,
    origin_trace_id VARCHAR(64) NOT NULL,
    origin_trace_source VARCHAR(100) NOT NULL,
    origin_request_id VARCHAR(64) NOT NULL,
    origin_request_source VARCHAR(100) NOT NULL,
    request_id VARCHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_ORDER_SLICES: &str = r#"
CREATE TABLE IF NOT EXISTS order_slices (
    id VARCHAR(64) PRIMARY KEY,
    order_id VARCHAR(64) NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
    instrument VARCHAR(50) NOT NULL,
    side VARCHAR(10) NOT NULL CHECK (side IN ('BUY', 'SELL')),
    quantity INTEGER NOT NULL CHECK (quantity > 0),
    sequence_number INTEGER NOT NULL CHECK (sequence_number > 0),
    status VARCHAR(20) NOT NULL DEFAULT 'PENDING'
        CHECK (status IN ('PENDING', 'EXECUTING', 'COMPLETED', 'CANCELLED', 'SKIPPED')),
    scheduled_at TIMESTAMPTZ NOT NULL,
    order_type VARCHAR(20) NOT NULL DEFAULT 'MARKET' CHECK (order_type IN ('MARKET', 'LIMIT')),
    limit_price DECIMAL(15, 4),
    product_type VARCHAR(20) NOT NULL DEFAULT 'CNC',
    validity VARCHAR(10) NOT NULL DEFAULT 'DAY',
    filled_quantity INTEGER NOT NULL DEFAULT 0 CHECK (filled_quantity >= 0),
    average_price DECIMAL(15, 4),
    request_id VARCHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT unique_order_sequence UNIQUE (order_id, sequence_number)
)
"#;

const CREATE_EXECUTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS order_slice_executions (
    id VARCHAR(64) PRIMARY KEY,
    slice_id VARCHAR(64) NOT NULL UNIQUE REFERENCES order_slices(id) ON DELETE CASCADE,

    attempt_id VARCHAR(100) NOT NULL UNIQUE,
    executor_id VARCHAR(100) NOT NULL,
    executor_claimed_at TIMESTAMPTZ NOT NULL,
    executor_timeout_at TIMESTAMPTZ NOT NULL,
    last_heartbeat_at TIMESTAMPTZ NOT NULL,

    execution_status VARCHAR(20) NOT NULL DEFAULT 'CLAIMED'
        CHECK (execution_status IN ('CLAIMED', 'PLACED', 'COMPLETED', 'SKIPPED')),

    broker_order_id VARCHAR(100),
    broker_order_status VARCHAR(20)
        CHECK (broker_order_status IS NULL OR broker_order_status IN (
            'PENDING', 'OPEN', 'PARTIALLY_FILLED', 'COMPLETE',
            'CANCELLED', 'REJECTED', 'EXPIRED'
        )),

    filled_quantity INTEGER NOT NULL DEFAULT 0 CHECK (filled_quantity >= 0),
    average_price DECIMAL(15, 4),
    execution_result VARCHAR(30)
        CHECK (execution_result IS NULL OR execution_result IN (
            'SUCCESS', 'PARTIAL_SUCCESS', 'BROKER_REJECTED',
            'VALIDATION_FAILED', 'EXECUTOR_TIMEOUT'
        )),

    placement_attempts INTEGER NOT NULL DEFAULT 0 CHECK (placement_attempts >= 0),
    last_attempt_at TIMESTAMPTZ,
    last_attempt_error VARCHAR(50),

    placement_confirmed_at TIMESTAMPTZ,
    last_broker_poll_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,

    error_code VARCHAR(50),
    error_message TEXT,

    request_id VARCHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_BROKER_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS order_slice_broker_events (
    id VARCHAR(64) PRIMARY KEY,
    execution_id VARCHAR(64) NOT NULL REFERENCES order_slice_executions(id) ON DELETE CASCADE,
    slice_id VARCHAR(64) NOT NULL REFERENCES order_slices(id) ON DELETE CASCADE,

    event_sequence INTEGER NOT NULL CHECK (event_sequence > 0),
    event_type VARCHAR(30) NOT NULL
        CHECK (event_type IN ('PLACE_ORDER', 'STATUS_POLL', 'CANCEL_REQUEST')),
    event_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    attempt_number INTEGER NOT NULL CHECK (attempt_number > 0),

    attempt_id VARCHAR(100) NOT NULL,
    executor_id VARCHAR(100) NOT NULL,

    broker_name VARCHAR(50) NOT NULL,
    broker_order_id VARCHAR(100),

    request_method VARCHAR(10),
    request_endpoint VARCHAR(200),
    request_payload JSONB,

    response_status_code INTEGER,
    response_body JSONB,
    response_time_ms INTEGER,

    broker_status VARCHAR(50),
    broker_message TEXT,
    filled_quantity INTEGER,
    pending_quantity INTEGER,
    average_price DECIMAL(15, 4),

    is_success BOOLEAN NOT NULL,
    error_code VARCHAR(50),
    error_message TEXT,

    request_id VARCHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    CONSTRAINT unique_execution_event_sequence UNIQUE (execution_id, event_sequence)
)
"#;

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_orders_origin_trace_id ON orders(origin_trace_id)",
    "CREATE INDEX IF NOT EXISTS idx_orders_queue_status ON orders(queue_status)",
    "CREATE INDEX IF NOT EXISTS idx_orders_queue_pending
        ON orders(queue_status, created_at) WHERE queue_status = 'PENDING'",
    "CREATE INDEX IF NOT EXISTS idx_order_slices_order_id ON order_slices(order_id)",
    "CREATE INDEX IF NOT EXISTS idx_order_slices_status_scheduled
        ON order_slices(status, scheduled_at) WHERE status = 'PENDING'",
    "CREATE INDEX IF NOT EXISTS idx_executions_slice_id ON order_slice_executions(slice_id)",
    "CREATE INDEX IF NOT EXISTS idx_executions_executor_id ON order_slice_executions(executor_id)",
    "CREATE INDEX IF NOT EXISTS idx_executions_status ON order_slice_executions(execution_status)",
    "CREATE INDEX IF NOT EXISTS idx_executions_active
        ON order_slice_executions(executor_timeout_at)
        WHERE execution_status IN ('CLAIMED', 'PLACED')",
    "CREATE INDEX IF NOT EXISTS idx_broker_events_execution_id
        ON order_slice_broker_events(execution_id)",
    "CREATE INDEX IF NOT EXISTS idx_broker_events_slice_id
        ON order_slice_broker_events(slice_id)",
    "CREATE INDEX IF NOT EXISTS idx_broker_events_attempt_id
        ON order_slice_broker_events(attempt_id)",
];

const CREATE_ORDERS_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS orders_history (
    history_id BIGSERIAL PRIMARY KEY,
    operation VARCHAR(10) NOT NULL CHECK (operation IN ('INSERT', 'UPDATE', 'DELETE')),
    changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    id VARCHAR(64) NOT NULL,
    instrument VARCHAR(50) NOT NULL,
    side VARCHAR(10) NOT NULL,
    total_quantity INTEGER NOT NULL,
    num_splits INTEGER NOT NULL,
    duration_minutes INTEGER NOT NULL,
    randomize BOOLEAN NOT NULL,
    order_unique_key VARCHAR(255) NOT NULL,
    queue_status VARCHAR(20) NOT NULL,
    skip_reason TEXT,
    split_completed_at TIMESTAMPTZ,
    origin_trace_id VARCHAR(64) NOT NULL,
    origin_trace_source VARCHAR(100) NOT NULL,
    origin_request_id VARCHAR(64) NOT NULL,
    origin_request_source VARCHAR(100) NOT NULL,
    request_id VARCHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_ORDER_SLICES_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS order_slices_history (
    history_id BIGSERIAL PRIMARY KEY,
    operation VARCHAR(10) NOT NULL CHECK (operation IN ('INSERT', 'UPDATE', 'DELETE')),
    changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    id VARCHAR(64) NOT NULL,
    order_id VARCHAR(64) NOT NULL,
    instrument VARCHAR(50) NOT NULL,
    side VARCHAR(10) NOT NULL,
    quantity INTEGER NOT NULL,
    sequence_number INTEGER NOT NULL,
    status VARCHAR(20) NOT NULL,
    scheduled_at TIMESTAMPTZ NOT NULL,
    order_type VARCHAR(20),
    limit_price DECIMAL(15, 4),
    product_type VARCHAR(20),
    validity VARCHAR(10),
    filled_quantity INTEGER,
    average_price DECIMAL(15, 4),
    request_id VARCHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_EXECUTIONS_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS order_slice_executions_history (
    history_id BIGSERIAL PRIMARY KEY,
    operation VARCHAR(10) NOT NULL CHECK (operation IN ('INSERT', 'UPDATE', 'DELETE')),
    changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    id VARCHAR(64) NOT NULL,
    slice_id VARCHAR(64) NOT NULL,
    attempt_id VARCHAR(100) NOT NULL,
    executor_id VARCHAR(100) NOT NULL,
    executor_claimed_at TIMESTAMPTZ NOT NULL,
    executor_timeout_at TIMESTAMPTZ NOT NULL,
    last_heartbeat_at TIMESTAMPTZ NOT NULL,
    execution_status VARCHAR(20) NOT NULL,
    broker_order_id VARCHAR(100),
    broker_order_status VARCHAR(20),
    filled_quantity INTEGER,
    average_price DECIMAL(15, 4),
    execution_result VARCHAR(30),
    placement_attempts INTEGER,
    last_attempt_at TIMESTAMPTZ,
    last_attempt_error VARCHAR(50),
    placement_confirmed_at TIMESTAMPTZ,
    last_broker_poll_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    error_code VARCHAR(50),
    error_message TEXT,
    request_id VARCHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_BROKER_EVENTS_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS order_slice_broker_events_history (
    history_id BIGSERIAL PRIMARY KEY,
    operation VARCHAR(10) NOT NULL CHECK (operation IN ('INSERT', 'UPDATE', 'DELETE')),
    changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    id VARCHAR(64) NOT NULL,
    execution_id VARCHAR(64) NOT NULL,
    slice_id VARCHAR(64) NOT NULL,
    event_sequence INTEGER NOT NULL,
    event_type VARCHAR(30) NOT NULL,
    event_timestamp TIMESTAMPTZ NOT NULL,
    attempt_number INTEGER NOT NULL,
    attempt_id VARCHAR(100) NOT NULL,
    executor_id VARCHAR(100) NOT NULL,
    broker_name VARCHAR(50) NOT NULL,
    broker_order_id VARCHAR(100),
    request_method VARCHAR(10),
    request_endpoint VARCHAR(200),
    request_payload JSONB,
    response_status_code INTEGER,
    response_body JSONB,
    response_time_ms INTEGER,
    broker_status VARCHAR(50),
    broker_message TEXT,
    filled_quantity INTEGER,
    pending_quantity INTEGER,
    average_price DECIMAL(15, 4),
    is_success BOOLEAN NOT NULL,
    error_code VARCHAR(50),
    error_message TEXT,
    request_id VARCHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

const HISTORY_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_orders_history_id ON orders_history(id)",
    "CREATE INDEX IF NOT EXISTS idx_orders_history_changed_at ON orders_history(changed_at)",
    "CREATE INDEX IF NOT EXISTS idx_order_slices_history_id ON order_slices_history(id)",
    "CREATE INDEX IF NOT EXISTS idx_executions_history_id ON order_slice_executions_history(id)",
    "CREATE INDEX IF NOT EXISTS idx_broker_events_history_id
        ON order_slice_broker_events_history(id)",
];

const ORDERS_TRIGGER_FN: &str = r#"
CREATE OR REPLACE FUNCTION orders_history_trigger()
RETURNS TRIGGER AS $$
DECLARE
    rec orders%ROWTYPE;
BEGIN
    IF (TG_OP = 'DELETE') THEN
        rec := OLD;
    ELSE
        rec := NEW;
    END IF;
    INSERT INTO orders_history (
        operation, changed_at,
        id, instrument, side, total_quantity, num_splits, duration_minutes,
        randomize, order_unique_key, queue_status, skip_reason,
        split_completed_at, origin_trace_id, origin_trace_source,
        origin_request_id, origin_request_source, request_id, created_at, updated_at
    ) VALUES (
        TG_OP, NOW(),
        rec.id, rec.instrument, rec.side, rec.total_quantity, rec.num_splits,
        rec.duration_minutes, rec.randomize, rec.order_unique_key,
        rec.queue_status, rec.skip_reason, rec.split_completed_at,
        rec.origin_trace_id, rec.origin_trace_source, rec.origin_request_id,
        rec.origin_request_source, rec.request_id, rec.created_at, rec.updated_at
    );
    IF (TG_OP = 'DELETE') THEN
        RETURN OLD;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql
"#;

const ORDER_SLICES_TRIGGER_FN: &str = r#"
CREATE OR REPLACE FUNCTION order_slices_history_trigger()
RETURNS TRIGGER AS $$
DECLARE
    rec order_slices%ROWTYPE;
BEGIN
    IF (TG_OP = 'DELETE') THEN
        rec := OLD;
    ELSE
        rec := NEW;
    END IF;
    INSERT INTO order_slices_history (
        operation, changed_at,
        id, order_id, instrument, side, quantity, sequence_number, status,
        scheduled_at, order_type, limit_price, product_type, validity,
        filled_quantity, average_price, request_id, created_at, updated_at
    ) VALUES (
        TG_OP, NOW(),
        rec.id, rec.order_id, rec.instrument, rec.side, rec.quantity,
        rec.sequence_number, rec.status, rec.scheduled_at, rec.order_type,
        rec.limit_price, rec.product_type, rec.validity, rec.filled_quantity,
        rec.average_price, rec.request_id, rec.created_at, rec.updated_at
    );
    IF (TG_OP = 'DELETE') THEN
        RETURN OLD;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql
"#;

const EXECUTIONS_TRIGGER_FN: &str = r#"
CREATE OR REPLACE FUNCTION order_slice_executions_history_trigger()
RETURNS TRIGGER AS $$
DECLARE
    rec order_slice_executions%ROWTYPE;
BEGIN
    IF (TG_OP = 'DELETE') THEN
        rec := OLD;
    ELSE
        rec := NEW;
    END IF;
    INSERT INTO order_slice_executions_history (
        operation, changed_at,
        id, slice_id, attempt_id, executor_id,
        executor_claimed_at, executor_timeout_at, last_heartbeat_at,
        execution_status, broker_order_id, broker_order_status,
        filled_quantity, average_price, execution_result,
        placement_attempts, last_attempt_at, last_attempt_error,
        placement_confirmed_at, last_broker_poll_at, completed_at,
        error_code, error_message, request_id, created_at, updated_at
    ) VALUES (
        TG_OP, NOW(),
        rec.id, rec.slice_id, rec.attempt_id, rec.executor_id,
        rec.executor_claimed_at, rec.executor_timeout_at, rec.last_heartbeat_at,
        rec.execution_status, rec.broker_order_id, rec.broker_order_status,
        rec.filled_quantity, rec.average_price, rec.execution_result,
        rec.placement_attempts, rec.last_attempt_at, rec.last_attempt_error,
        rec.placement_confirmed_at, rec.last_broker_poll_at, rec.completed_at,
        rec.error_code, rec.error_message, rec.request_id, rec.created_at, rec.updated_at
    );
    IF (TG_OP = 'DELETE') THEN
        RETURN OLD;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql
"#;

const BROKER_EVENTS_TRIGGER_FN: &str = r#"
CREATE OR REPLACE FUNCTION order_slice_broker_events_history_trigger()
RETURNS TRIGGER AS $$
DECLARE
    rec order_slice_broker_events%ROWTYPE;
BEGIN
    IF (TG_OP = 'DELETE') THEN
        rec := OLD;
    ELSE
        rec := NEW;
    END IF;
    INSERT INTO order_slice_broker_events_history (
        operation, changed_at,
        id, execution_id, slice_id, event_sequence, event_type, event_timestamp,
        attempt_number, attempt_id, executor_id, broker_name, broker_order_id,
        request_method, request_endpoint, request_payload,
        response_status_code, response_body, response_time_ms,
        broker_status, broker_message, filled_quantity, pending_quantity,
        average_price, is_success, error_code, error_message,
        request_id, created_at, updated_at
    ) VALUES (
        TG_OP, NOW(),
        rec.id, rec.execution_id, rec.slice_id, rec.event_sequence,
        rec.event_type, rec.event_timestamp, rec.attempt_number, rec.attempt_id,
        rec.executor_id, rec.broker_name, rec.broker_order_id,
        rec.request_method, rec.request_endpoint, rec.request_payload,
        rec.response_status_code, rec.response_body, rec.response_time_ms,
        rec.broker_status, rec.broker_message, rec.filled_quantity,
        rec.pending_quantity, rec.average_price, rec.is_success,
        rec.error_code, rec.error_message, rec.request_id, rec.created_at, rec.updated_at
    );
    IF (TG_OP = 'DELETE') THEN
        RETURN OLD;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql
"#;

const TRIGGERS: &[(&str, &str, &str)] = &[
    ("orders_history_trigger", "orders", "orders_history_trigger"),
    (
        "order_slices_history_trigger",
        "order_slices",
        "order_slices_history_trigger",
    ),
    (
        "order_slice_executions_history_trigger",
        "order_slice_executions",
        "order_slice_executions_history_trigger",
    ),
    (
        "order_slice_broker_events_history_trigger",
        "order_slice_broker_events",
        "order_slice_broker_events_history_trigger",
    ),
];

/// Apply the full schema. Safe to run repeatedly.
pub async fn apply(pool: &PgPool) -> Result<(), sqlx::Error> {
    let tables = [
        CREATE_ORDERS,
        CREATE_ORDER_SLICES,
        CREATE_EXECUTIONS,
        CREATE_BROKER_EVENTS,
        CREATE_ORDERS_HISTORY,
        CREATE_ORDER_SLICES_HISTORY,
        CREATE_EXECUTIONS_HISTORY,
        CREATE_BROKER_EVENTS_HISTORY,
    ];
    for ddl in tables {
        sqlx::query(ddl).execute(pool).await?;
    }

    for ddl in INDEXES.iter().chain(HISTORY_INDEXES) {
        sqlx::query(ddl).execute(pool).await?;
    }

    let functions = [
        ORDERS_TRIGGER_FN,
        ORDER_SLICES_TRIGGER_FN,
        EXECUTIONS_TRIGGER_FN,
        BROKER_EVENTS_TRIGGER_FN,
    ];
    for ddl in functions {
        sqlx::query(ddl).execute(pool).await?;
    }

    for (trigger, table, function) in TRIGGERS {
        sqlx::query(&format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            trigger, table
        ))
        .execute(pool)
        .await?;
        sqlx::query(&format!(
            "CREATE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {} \
             FOR EACH ROW EXECUTE FUNCTION {}()",
            trigger, table, function
        ))
        .execute(pool)
        .await?;
    }

    tracing::info!("Store schema applied");
    Ok(())
}
