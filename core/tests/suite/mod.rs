mod lifecycle;
mod process_evaluator;
mod queue_order;
